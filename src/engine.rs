use std::{sync::Arc, time::Duration};

use autopilot_plugin::{
    EventBus, Lifecycle, LifecycleError, LifecycleState, RegistryError, event::names,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::registry::{LoadSummary, PluginCatalog, PluginRegistry};
use crate::watcher::{DirectoryWatcher, PLUGIN_MARKER_EXT, PluginDirWatch};

const PLUGIN_DIR_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("plugin directory watcher: {0}")]
    Watcher(String),
}

/// Owns the bus, the plugin registry and the run state.
pub struct Engine {
    config: AppConfig,
    bus: Arc<EventBus>,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<PluginRegistry>,
    watcher: Option<DirectoryWatcher>,
}

impl Engine {
    pub fn new(config: AppConfig, catalog: PluginCatalog) -> Self {
        let bus = Arc::new(EventBus::with_workers(config.bus_workers.max(1)));
        let lifecycle = Arc::new(Lifecycle::new());
        let registry = PluginRegistry::new(
            Arc::clone(&bus),
            Arc::new(config.to_plugin_config()),
            Arc::clone(&lifecycle),
            catalog,
        );
        Self {
            config,
            bus,
            lifecycle,
            registry,
            watcher: None,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Loads the configured plugins, starts watching the plugin directory
    /// and announces `system_startup`.
    pub async fn start(&mut self) -> Result<LoadSummary, EngineError> {
        self.lifecycle.start()?;
        let summary = self
            .registry
            .load_all(&self.config.plugins, &self.config.required_plugins)?;
        for (name, reason) in &summary.failed {
            warn!(plugin = %name, %reason, "plugin not loaded");
        }

        if let Some(dir) = self.config.plugin_dir.clone() {
            std::fs::create_dir_all(&dir)
                .map_err(|e| EngineError::Watcher(format!("{}: {e}", dir.display())))?;
            let watcher = DirectoryWatcher::new(
                dir,
                Arc::new(PluginDirWatch::new(&self.registry)),
                &[PLUGIN_MARKER_EXT],
                true,
                true,
                PLUGIN_DIR_POLL,
            )
            .await
            .map_err(|e| EngineError::Watcher(e.to_string()))?;
            self.watcher = Some(watcher);
        }

        info!(plugins = ?summary.loaded, "engine started");
        self.bus.publish(names::SYSTEM_STARTUP, Value::Null);
        Ok(summary)
    }

    /// Publishes each non-empty input line as `user_input` until the input
    /// ends or shutdown is requested.
    pub async fn run<R>(&self, input: R) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            tokio::select! {
                biased;
                _ = self.lifecycle.cancelled() => {
                    info!("shutdown requested, leaving the input loop");
                    return Ok(());
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let delivery = self.bus.publish(names::USER_INPUT, json!(line));
                        for err in &delivery.errors {
                            error!(error = %err, "user_input handler failed");
                        }
                    }
                    None => {
                        info!("input closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Removes every plugin in reverse load order and marks the engine
    /// stopped. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.lifecycle.request_shutdown();
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        if self.lifecycle.state() == LifecycleState::Stopped {
            return;
        }
        self.registry.shutdown_all();
        match self.lifecycle.finish() {
            Ok(()) => info!("engine stopped"),
            Err(err) => warn!(error = %err, "could not finish the lifecycle"),
        }
    }
}
