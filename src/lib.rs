pub mod config;
pub mod engine;
pub mod logger;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod plugins;
pub mod prompt;
pub mod registry;
pub mod runlog;
pub mod session;
pub mod watcher;
