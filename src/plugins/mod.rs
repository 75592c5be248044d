//! Plugins that ship with the binary.

pub mod console;
pub mod debug;
pub mod plugin_manager;
pub mod system;
pub mod task_planner;

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::model::ModelLoader;
use crate::registry::PluginCatalog;

pub use console::ConsolePlugin;
pub use debug::DebugPlugin;
pub use plugin_manager::PluginManagerPlugin;
pub use system::SystemPlugin;
pub use task_planner::TaskPlannerPlugin;

/// Catalog of the built-in plugins. The planner runs its model work on
/// `runtime` and loads models through `loader`.
pub fn builtin_catalog(loader: Arc<dyn ModelLoader>, runtime: Handle) -> PluginCatalog {
    PluginCatalog::new()
        .with("console", || Box::new(ConsolePlugin::stdout()))
        .with("system", || Box::new(SystemPlugin::new()))
        .with("plugin_manager", || Box::new(PluginManagerPlugin::new()))
        .with("debug", || Box::new(DebugPlugin::new()))
        .with("task_planner", move || {
            Box::new(TaskPlannerPlugin::new(Arc::clone(&loader), runtime.clone()))
        })
}
