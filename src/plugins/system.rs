use std::sync::Arc;

use autopilot_plugin::{CommandSpec, Plugin, PluginContext, PluginError, event::names};
use tracing::info;

const HELP: &str = "\
Commands:
  help                  show this text
  status                show the running state and loaded plugins
  exit | quit           shut down
  plugins               list loaded and available plugins
  add <plugin>          load a plugin
  rm <plugin>           remove a plugin
  debug <event> [data]  publish an event by hand
  /plan <request>       plan a task
  /show [-d]            show the current plan
  /execute              run the current plan
  /mode [mode] [n]      show or change the orchestration mode
  /models               list models
  /logs [kind]          show recent run log entries";

/// Built-in `exit`, `help` and `status` commands.
#[derive(Default)]
pub struct SystemPlugin;

impl SystemPlugin {
    pub fn new() -> Self {
        Self
    }
}

fn status(ctx: &PluginContext) -> String {
    let plugins = ctx.host().map(|host| host.plugins()).unwrap_or_default();
    format!(
        "State: {}\nPlugins: {}",
        ctx.lifecycle().state(),
        plugins.join(", ")
    )
}

impl Plugin for SystemPlugin {
    fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
        let weak = Arc::downgrade(&ctx);
        ctx.subscribe_fn(names::USER_INPUT, move |event| {
            let Some(ctx) = weak.upgrade() else {
                return Ok(());
            };
            match event.text().map(str::trim) {
                Some("exit" | "quit") => {
                    ctx.output("Shutting down...");
                    if ctx.lifecycle().request_shutdown() {
                        info!("shutdown requested from input");
                    }
                }
                Some("help") => ctx.output(HELP),
                Some("status") => ctx.output(status(&ctx)),
                _ => {}
            }
            Ok(())
        });
        Ok(())
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::new("user_input", "Run a console command such as `status`").param("text", "str")]
    }
}
