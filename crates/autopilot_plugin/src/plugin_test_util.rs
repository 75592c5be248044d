use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use serde_json::Value;

use crate::plugin::{CommandSpec, Plugin, PluginContext, PluginError};

/// Shared counters a test keeps after handing the plugin to a registry.
#[derive(Debug, Default)]
pub struct Probe {
    pub inits: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub seen: Mutex<Vec<(String, Value)>>,
}

impl Probe {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, Value)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Plugin that records its lifecycle and every event it listens to.
pub struct RecordingPlugin {
    probe: Arc<Probe>,
    listen: Vec<String>,
    commands: Vec<CommandSpec>,
    fail_init: bool,
}

impl RecordingPlugin {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            listen: Vec::new(),
            commands: Vec::new(),
            fail_init: false,
        }
    }

    pub fn listening(mut self, event: &str) -> Self {
        self.listen.push(event.to_string());
        self
    }

    pub fn advertising(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }
}

impl Plugin for RecordingPlugin {
    fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(PluginError::Other("init refused".into()));
        }
        for event in &self.listen {
            let probe = Arc::clone(&self.probe);
            ctx.subscribe_fn(event, move |e| {
                if let Ok(mut seen) = probe.seen.lock() {
                    seen.push((e.name.clone(), e.payload.clone()));
                }
                Ok(())
            });
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), PluginError> {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commands(&self) -> Vec<CommandSpec> {
        self.commands.clone()
    }
}
