use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use autopilot_plugin::{
    CommandSpec, EventBus, Lifecycle, Plugin, PluginContext, PluginHost, RegistryError,
    event::names,
};
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::{Value, json};
use tracing::{error, info, warn};

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Plugin constructors that `load` can resolve by name.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.insert(name, factory);
        self
    }

    pub fn insert<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Plugin>, RegistryError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::UnknownPlugin(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// Outcome of [`PluginRegistry::load_all`] when every required plugin came up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    /// Plugin name and the reason it did not load.
    pub failed: Vec<(String, String)>,
}

struct Slot {
    seq: u64,
    plugin: Mutex<Box<dyn Plugin>>,
    ctx: Arc<PluginContext>,
    commands: Mutex<Vec<CommandSpec>>,
}

impl Slot {
    fn plugin(&self) -> std::sync::MutexGuard<'_, Box<dyn Plugin>> {
        match self.plugin.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

/// The set of live plugins, keyed by name.
///
/// Every plugin gets its own [`PluginContext`]; subscriptions made through it
/// are dropped when the plugin is removed.
pub struct PluginRegistry {
    me: Weak<PluginRegistry>,
    bus: Arc<EventBus>,
    config: Arc<Value>,
    lifecycle: Arc<Lifecycle>,
    catalog: PluginCatalog,
    plugins: DashMap<String, Arc<Slot>>,
    next_seq: AtomicU64,
}

impl PluginRegistry {
    pub fn new(
        bus: Arc<EventBus>,
        config: Arc<Value>,
        lifecycle: Arc<Lifecycle>,
        catalog: PluginCatalog,
    ) -> Arc<Self> {
        let registry = Arc::new_cyclic(|me: &Weak<PluginRegistry>| Self {
            me: me.clone(),
            bus,
            config,
            lifecycle,
            catalog,
            plugins: DashMap::new(),
            next_seq: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&registry);
        registry
            .bus
            .subscribe_fn(names::REQUEST_PLUGIN_COMMANDS, move |_| {
                if let Some(registry) = weak.upgrade() {
                    registry.advertise_all();
                }
                Ok(())
            });
        registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn plugins(&self) -> Vec<String> {
        let mut slots: Vec<(u64, String)> = self
            .plugins
            .iter()
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        slots.sort();
        slots.into_iter().map(|(_, name)| name).collect()
    }

    pub fn available(&self) -> Vec<String> {
        self.catalog.names()
    }

    /// Adds `plugin` under `name` and initialises it.
    ///
    /// The name is reserved before `init` runs so a concurrent registration
    /// of the same name fails. If `init` fails the plugin is dropped and
    /// anything it subscribed is released.
    pub fn register(&self, name: &str, plugin: Box<dyn Plugin>) -> Result<(), RegistryError> {
        let host: Weak<dyn PluginHost> = self.me.clone();
        let ctx = Arc::new(PluginContext::new(
            name,
            Arc::clone(&self.bus),
            Arc::clone(&self.config),
            Arc::clone(&self.lifecycle),
            Some(host),
        ));
        let slot = Arc::new(Slot {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            plugin: Mutex::new(plugin),
            ctx: Arc::clone(&ctx),
            commands: Mutex::new(Vec::new()),
        });

        match self.plugins.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(RegistryError::Duplicate(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }

        let initialised = {
            let mut plugin = slot.plugin();
            plugin.init(Arc::clone(&ctx)).map(|_| plugin.commands())
        };
        let commands = match initialised {
            Ok(commands) => commands,
            Err(source) => {
                self.plugins.remove_if(name, |_, s| Arc::ptr_eq(s, &slot));
                ctx.release_subscriptions();
                error!(plugin = name, error = %source, "plugin failed to initialise");
                return Err(RegistryError::Init {
                    name: name.to_string(),
                    source,
                });
            }
        };
        if let Ok(mut cached) = slot.commands.lock() {
            *cached = commands;
        }

        info!(plugin = name, subscriptions = ctx.subscription_count(), "plugin registered");
        self.bus.publish(names::PLUGIN_REGISTERED, json!({ "name": name }));
        self.advertise(name, &slot);
        Ok(())
    }

    /// Builds the named plugin from the catalog and registers it.
    pub fn load(&self, name: &str) -> Result<(), RegistryError> {
        if self.contains(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        let plugin = self.catalog.create(name)?;
        self.register(name, plugin)
    }

    /// Shuts the plugin down and drops its subscriptions. A failing
    /// `shutdown` is logged; the plugin is removed regardless.
    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let (_, slot) = self
            .plugins
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if let Err(err) = slot.plugin().shutdown() {
            warn!(plugin = name, error = %err, "plugin shutdown failed");
        }
        let released = slot.ctx.release_subscriptions();
        info!(plugin = name, released, "plugin removed");
        self.bus.publish(names::PLUGIN_REMOVED, json!({ "name": name }));
        Ok(())
    }

    /// Loads every name, then checks that each required plugin is present.
    ///
    /// Plugins loaded by this call stay loaded when the check fails.
    pub fn load_all(
        &self,
        names: &[String],
        required: &[String],
    ) -> Result<LoadSummary, RegistryError> {
        let mut summary = LoadSummary::default();
        for name in names {
            match self.load(name) {
                Ok(()) => summary.loaded.push(name.clone()),
                Err(err) => {
                    error!(plugin = %name, error = %err, "could not load plugin");
                    summary.failed.push((name.clone(), err.to_string()));
                }
            }
        }

        let missing: BTreeSet<String> = required
            .iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingRequired(missing.into_iter().collect()));
        }
        Ok(summary)
    }

    /// Removes every plugin, newest first, then announces `system_shutdown`.
    pub fn shutdown_all(&self) {
        let mut names = self.plugins();
        names.reverse();
        for name in names {
            if let Err(err) = self.remove(&name) {
                warn!(plugin = %name, error = %err, "plugin vanished during shutdown");
            }
        }
        self.bus.publish(names::SYSTEM_SHUTDOWN, Value::Null);
    }

    fn advertise(&self, name: &str, slot: &Slot) {
        let commands = slot.commands();
        if commands.is_empty() {
            return;
        }
        self.bus.publish(
            names::PLUGIN_COMMANDS_REGISTERED,
            json!({ "plugin_name": name, "commands": commands }),
        );
    }

    fn advertise_all(&self) {
        let slots: Vec<(String, Arc<Slot>)> = self
            .plugins
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (name, slot) in slots {
            self.advertise(&name, &slot);
        }
    }
}

impl PluginHost for PluginRegistry {
    fn load(&self, name: &str) -> Result<(), RegistryError> {
        PluginRegistry::load(self, name)
    }

    fn remove(&self, name: &str) -> Result<(), RegistryError> {
        PluginRegistry::remove(self, name)
    }

    fn plugins(&self) -> Vec<String> {
        PluginRegistry::plugins(self)
    }

    fn available(&self) -> Vec<String> {
        PluginRegistry::available(self)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins())
            .field("catalog", &self.catalog)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_plugin::PluginError;
    use autopilot_plugin::plugin_test_util::{Probe, RecordingPlugin};

    fn registry(catalog: PluginCatalog) -> (Arc<PluginRegistry>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let registry = PluginRegistry::new(
            Arc::clone(&bus),
            Arc::new(json!({})),
            Arc::new(Lifecycle::new()),
            catalog,
        );
        (registry, bus)
    }

    fn record(bus: &EventBus, event: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_fn(event, move |e| {
            sink.lock().unwrap().push(e.payload.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn duplicate_names_are_rejected_until_removed() {
        let (registry, bus) = registry(PluginCatalog::new());
        let registered = record(&bus, names::PLUGIN_REGISTERED);
        let probe = Arc::new(Probe::default());

        registry
            .register("rec", Box::new(RecordingPlugin::new(probe.clone())))
            .unwrap();
        let again = registry.register("rec", Box::new(RecordingPlugin::new(probe.clone())));
        assert_eq!(again, Err(RegistryError::Duplicate("rec".into())));
        assert_eq!(probe.inits(), 1);

        registry.remove("rec").unwrap();
        registry
            .register("rec", Box::new(RecordingPlugin::new(probe.clone())))
            .unwrap();
        assert_eq!(probe.inits(), 2);
        assert_eq!(probe.shutdowns(), 1);
        assert_eq!(registered.lock().unwrap().len(), 2);
    }

    #[test]
    fn remove_drops_subscriptions_and_announces() {
        let (registry, bus) = registry(PluginCatalog::new());
        let removed = record(&bus, names::PLUGIN_REMOVED);
        let probe = Arc::new(Probe::default());
        registry
            .register("rec", Box::new(RecordingPlugin::new(probe.clone()).listening("tick")))
            .unwrap();

        bus.publish("tick", json!(1));
        registry.remove("rec").unwrap();
        bus.publish("tick", json!(2));

        assert_eq!(probe.seen(), vec![("tick".to_string(), json!(1))]);
        assert_eq!(bus.subscriber_count("tick"), 0);
        assert_eq!(*removed.lock().unwrap(), vec![json!({"name": "rec"})]);
        assert_eq!(registry.remove("rec"), Err(RegistryError::NotFound("rec".into())));
    }

    #[test]
    fn failed_init_leaves_nothing_behind() {
        struct HalfDone;
        impl Plugin for HalfDone {
            fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
                ctx.subscribe_fn("tick", |_| Ok(()));
                Err(PluginError::Config("missing key".into()))
            }
        }
        let (registry, bus) = registry(PluginCatalog::new());

        let err = registry.register("half", Box::new(HalfDone)).unwrap_err();

        assert!(matches!(err, RegistryError::Init { ref name, .. } if name == "half"));
        assert!(!registry.contains("half"));
        assert_eq!(bus.subscriber_count("tick"), 0);
    }

    #[test]
    fn unknown_plugin_is_a_typed_error() {
        let (registry, _) = registry(PluginCatalog::new());
        assert_eq!(registry.load("ghost"), Err(RegistryError::UnknownPlugin("ghost".into())));
    }

    #[test]
    fn load_all_reports_missing_required_but_keeps_loaded() {
        let probe = Arc::new(Probe::default());
        let p = probe.clone();
        let catalog = PluginCatalog::new()
            .with("a", move || Box::new(RecordingPlugin::new(p.clone())));
        let (registry, _) = registry(catalog);

        let err = registry
            .load_all(
                &["a".into(), "b".into()],
                &["c".into(), "a".into(), "b".into()],
            )
            .unwrap_err();

        assert_eq!(err, RegistryError::MissingRequired(vec!["b".into(), "c".into()]));
        assert_eq!(registry.plugins(), vec!["a"]);
    }

    #[test]
    fn load_all_summarises_failures() {
        let probe = Arc::new(Probe::default());
        let p = probe.clone();
        let catalog = PluginCatalog::new()
            .with("a", move || Box::new(RecordingPlugin::new(p.clone())));
        let (registry, _) = registry(catalog);

        let summary = registry
            .load_all(&["a".into(), "zzz".into()], &["a".into()])
            .unwrap();

        assert_eq!(summary.loaded, vec!["a"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "zzz");
    }

    #[test]
    fn shutdown_all_goes_newest_first_and_announces_once() {
        let (registry, bus) = registry(PluginCatalog::new());
        let removed = record(&bus, names::PLUGIN_REMOVED);
        let shutdowns = record(&bus, names::SYSTEM_SHUTDOWN);
        for name in ["first", "second", "third"] {
            registry
                .register(name, Box::new(RecordingPlugin::new(Arc::new(Probe::default()))))
                .unwrap();
        }

        registry.shutdown_all();

        let order: Vec<Value> = removed.lock().unwrap().clone();
        assert_eq!(
            order,
            vec![json!({"name": "third"}), json!({"name": "second"}), json!({"name": "first"})]
        );
        assert_eq!(shutdowns.lock().unwrap().len(), 1);
        assert!(registry.plugins().is_empty());
    }

    #[test]
    fn commands_are_advertised_on_register_and_on_request() {
        let (registry, bus) = registry(PluginCatalog::new());
        let adverts = record(&bus, names::PLUGIN_COMMANDS_REGISTERED);
        let plugin = RecordingPlugin::new(Arc::new(Probe::default()))
            .advertising(CommandSpec::new("beep", "Make a sound"));
        registry.register("speaker", Box::new(plugin)).unwrap();
        registry
            .register("quiet", Box::new(RecordingPlugin::new(Arc::new(Probe::default()))))
            .unwrap();

        bus.publish(names::REQUEST_PLUGIN_COMMANDS, json!({}));

        let adverts = adverts.lock().unwrap();
        assert_eq!(adverts.len(), 2);
        assert_eq!(adverts[0]["plugin_name"], json!("speaker"));
        assert_eq!(adverts[1]["commands"][0]["event"], json!("beep"));
    }

    #[test]
    fn plugins_can_drive_the_registry_through_the_host() {
        struct Loader;
        impl Plugin for Loader {
            fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
                ctx.host()?.load("child")?;
                Ok(())
            }
        }
        let catalog = PluginCatalog::new()
            .with("child", || Box::new(RecordingPlugin::new(Arc::new(Probe::default()))));
        let (registry, _) = registry(catalog);

        registry.register("loader", Box::new(Loader)).unwrap();

        assert_eq!(registry.plugins(), vec!["loader", "child"]);
        assert_eq!(registry.available(), vec!["child"]);
    }
}
