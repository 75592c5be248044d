use std::sync::Arc;

use autopilot_plugin::{CommandSpec, Event, Plugin, PluginContext, PluginError, event::names};
use tracing::info;

/// Adds and removes plugins from typed commands:
/// `add <name>`, `rm <name>` / `remove <name>` and `plugins`.
#[derive(Default)]
pub struct PluginManagerPlugin;

impl PluginManagerPlugin {
    pub fn new() -> Self {
        Self
    }
}

enum Command<'a> {
    Add(&'a str),
    Remove(&'a str),
    List,
}

fn parse(line: &str) -> Option<Command<'_>> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let arg = parts.next();
    match (verb, arg) {
        ("add", Some(name)) => Some(Command::Add(name)),
        ("rm" | "remove", Some(name)) => Some(Command::Remove(name)),
        ("plugins", None) => Some(Command::List),
        _ => None,
    }
}

fn handle(ctx: &PluginContext, event: &Event) -> anyhow::Result<()> {
    let Some(command) = event.text().and_then(|line| parse(line.trim())) else {
        return Ok(());
    };
    let host = ctx.host()?;
    match command {
        Command::Add(name) => match host.load(name) {
            Ok(()) => {
                info!(plugin = %name, "added on request");
                ctx.output(format!("Added: {name}"));
            }
            Err(e) => ctx.output(format!("Add failed: {e}")),
        },
        Command::Remove(name) => match host.remove(name) {
            Ok(()) => {
                info!(plugin = %name, "removed on request");
                ctx.output(format!("Removed: {name}"));
            }
            Err(e) => ctx.output(format!("Remove failed: {e}")),
        },
        Command::List => {
            let loaded = host.plugins();
            let available: Vec<String> = host
                .available()
                .into_iter()
                .filter(|name| !loaded.contains(name))
                .collect();
            ctx.output(format!(
                "Loaded: {}\nAvailable: {}",
                loaded.join(", "),
                if available.is_empty() { "-".to_string() } else { available.join(", ") }
            ));
        }
    }
    Ok(())
}

impl Plugin for PluginManagerPlugin {
    fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
        let weak = Arc::downgrade(&ctx);
        ctx.subscribe_fn(names::USER_INPUT, move |event| match weak.upgrade() {
            Some(ctx) => handle(&ctx, event),
            None => Ok(()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::console::{ConsolePlugin, tests::Captured};
    use crate::registry::{PluginCatalog, PluginRegistry};
    use autopilot_plugin::plugin_test_util::{Probe, RecordingPlugin};
    use autopilot_plugin::{EventBus, Lifecycle};
    use serde_json::json;

    fn setup() -> (Arc<PluginRegistry>, Captured, Arc<Probe>) {
        let captured = Captured::default();
        let probe = Arc::new(Probe::default());
        let out = captured.clone();
        let p = probe.clone();
        let catalog = PluginCatalog::new()
            .with("console", move || Box::new(ConsolePlugin::with_writer(Box::new(out.clone()))))
            .with("plugin_manager", || Box::new(PluginManagerPlugin::new()))
            .with("echo", move || Box::new(RecordingPlugin::new(p.clone())));
        let registry = PluginRegistry::new(
            Arc::new(EventBus::new()),
            Arc::new(json!({})),
            Arc::new(Lifecycle::new()),
            catalog,
        );
        registry.load("console").unwrap();
        registry.load("plugin_manager").unwrap();
        (registry, captured, probe)
    }

    #[test]
    fn adds_and_removes_by_name() {
        let (registry, captured, probe) = setup();
        let bus = registry.bus().clone();

        bus.publish(names::USER_INPUT, json!("add echo"));
        assert!(registry.contains("echo"));
        assert_eq!(probe.inits(), 1);

        bus.publish(names::USER_INPUT, json!("rm echo"));
        assert!(!registry.contains("echo"));
        assert_eq!(probe.shutdowns(), 1);

        let text = captured.text();
        assert!(text.contains("Added: echo"));
        assert!(text.contains("Removed: echo"));
    }

    #[test]
    fn reports_failures_instead_of_raising() {
        let (registry, captured, _) = setup();
        let bus = registry.bus().clone();

        bus.publish(names::USER_INPUT, json!("add nope"));
        bus.publish(names::USER_INPUT, json!("remove echo"));

        let text = captured.text();
        assert!(text.contains("Add failed: no plugin factory named `nope`"));
        assert!(text.contains("Remove failed: plugin `echo` is not registered"));
    }

    #[test]
    fn ignores_unrelated_input() {
        let (registry, captured, _) = setup();
        registry.bus().publish(names::USER_INPUT, json!("hello there"));
        registry.bus().publish(names::USER_INPUT, json!("add"));
        assert_eq!(captured.text(), "");
    }

    #[test]
    fn lists_loaded_and_available_plugins() {
        let (registry, captured, _) = setup();
        registry.bus().publish(names::USER_INPUT, json!("plugins"));
        let text = captured.text();
        assert!(text.contains("Loaded: console, plugin_manager"));
        assert!(text.contains("Available: echo"));
    }
}
