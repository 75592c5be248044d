use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{
    bus::{Delivery, EventBus, EventHandler, SubscriptionId},
    event::{Event, names},
    lifecycle::Lifecycle,
};

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PluginError {
    #[error("JSON error: {0}")]
    Json(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("plugin is in an invalid state")]
    InvalidState,
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        PluginError::Json(e.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(e: anyhow::Error) -> Self {
        PluginError::Other(e.to_string())
    }
}

impl From<RegistryError> for PluginError {
    fn from(e: RegistryError) -> Self {
        PluginError::Other(e.to_string())
    }
}

/// Failures of registry operations. Always returned to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("plugin `{0}` is already registered")]
    Duplicate(String),
    #[error("plugin `{0}` is not registered")]
    NotFound(String),
    #[error("no plugin factory named `{0}`")]
    UnknownPlugin(String),
    #[error("missing required plugins: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
    #[error("plugin `{name}` failed to initialise: {source}")]
    Init {
        name: String,
        #[source]
        source: PluginError,
    },
    #[error("plugin host is no longer available")]
    HostGone,
}

/// A command a plugin understands, advertised to the task planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub event: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl CommandSpec {
    pub fn new(event: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, kind: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), kind.into());
        self
    }
}

/// The one trait plugin authors implement.
///
/// `init` receives the context the plugin keeps for its whole life; every
/// subscription made through the context is dropped by the host when the
/// plugin is removed, after `shutdown` has returned.
pub trait Plugin: Send + Sync {
    fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError>;

    fn shutdown(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Commands this plugin wants the planner to know about.
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
}

/// Registry operations a plugin may call on its host.
pub trait PluginHost: Send + Sync {
    fn load(&self, name: &str) -> Result<(), RegistryError>;
    fn remove(&self, name: &str) -> Result<(), RegistryError>;
    /// Registered plugin names.
    fn plugins(&self) -> Vec<String>;
    /// Names that `load` can resolve.
    fn available(&self) -> Vec<String>;
}

pub struct PluginContext {
    name: String,
    bus: Arc<EventBus>,
    config: Arc<Value>,
    host: Option<Weak<dyn PluginHost>>,
    lifecycle: Arc<Lifecycle>,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

impl PluginContext {
    pub fn new(
        name: impl Into<String>,
        bus: Arc<EventBus>,
        config: Arc<Value>,
        lifecycle: Arc<Lifecycle>,
        host: Option<Weak<dyn PluginHost>>,
    ) -> Self {
        Self {
            name: name.into(),
            bus,
            config,
            host,
            lifecycle,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The merged application configuration.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// A top-level configuration section, usually keyed by plugin name.
    pub fn section(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// The registry, unless it has already been dropped.
    pub fn host(&self) -> Result<Arc<dyn PluginHost>, RegistryError> {
        self.host
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(RegistryError::HostGone)
    }

    pub fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.bus.subscribe(event, handler);
        let mut subs = self.lock_subscriptions();
        if !subs.iter().any(|(e, existing)| e == event && *existing == id) {
            subs.push((event.to_string(), id));
        }
        id
    }

    pub fn subscribe_fn<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event, Arc::new(handler))
    }

    pub fn publish(&self, event: &str, payload: Value) -> Delivery {
        self.bus.publish(event, payload)
    }

    /// Sends a line of text to whatever renders `output` events.
    pub fn output(&self, text: impl Into<String>) {
        self.bus.publish(names::OUTPUT, Value::String(text.into()));
    }

    pub fn subscription_count(&self) -> usize {
        self.lock_subscriptions().len()
    }

    /// Drops every subscription made through this context. Called by the
    /// host once the plugin has shut down.
    pub fn release_subscriptions(&self) -> usize {
        let subs: Vec<_> = self.lock_subscriptions().drain(..).collect();
        let count = subs.len();
        for (event, id) in subs {
            self.bus.unsubscribe(&event, id);
        }
        debug!(plugin = %self.name, count, "released subscriptions");
        count
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<(String, SubscriptionId)>> {
        match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("subscriptions", &self.subscription_count())
            .field("lifecycle", &self.lifecycle.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(bus: &Arc<EventBus>) -> PluginContext {
        PluginContext::new(
            "probe",
            Arc::clone(bus),
            Arc::new(json!({"probe": {"greeting": "hi"}})),
            Arc::new(Lifecycle::new()),
            None,
        )
    }

    #[test]
    fn release_drops_only_this_contexts_subscriptions() {
        let bus = Arc::new(EventBus::new());
        let ctx = context(&bus);
        ctx.subscribe_fn("tick", |_| Ok(()));
        ctx.subscribe_fn("tock", |_| Ok(()));
        bus.subscribe_fn("tick", |_| Ok(()));

        assert_eq!(ctx.release_subscriptions(), 2);
        assert_eq!(bus.subscriber_count("tick"), 1);
        assert_eq!(bus.subscriber_count("tock"), 0);
        assert_eq!(ctx.subscription_count(), 0);
    }

    #[test]
    fn reads_config_sections_and_reports_missing_host() {
        let bus = Arc::new(EventBus::new());
        let ctx = context(&bus);
        assert_eq!(ctx.section("probe").and_then(|s| s.get("greeting")), Some(&json!("hi")));
        assert_eq!(ctx.host().err(), Some(RegistryError::HostGone));
    }

    #[test]
    fn missing_required_lists_names() {
        let err = RegistryError::MissingRequired(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "missing required plugins: a, b");
    }
}
