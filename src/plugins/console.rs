use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use autopilot_plugin::{
    CommandSpec, Event, Plugin, PluginContext, PluginError, event::names,
};
use serde_json::Value;

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Prints `output` events and start/stop notices.
pub struct ConsolePlugin {
    sink: Sink,
    ctx: Option<Arc<PluginContext>>,
}

impl ConsolePlugin {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(writer)),
            ctx: None,
        }
    }
}

/// Text shown for an `output` payload: strings as they are, `{type, text}`
/// objects as `[TYPE] text`.
pub fn render(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Object(map) => {
            let kind = map.get("type").and_then(Value::as_str).unwrap_or("INFO");
            let text = map.get("text").and_then(Value::as_str).unwrap_or_default();
            format!("[{}] {}", kind.to_uppercase(), text)
        }
        Value::Null => String::new(),
        other => format!("Output: {other}"),
    }
}

fn write_line(sink: &Sink, line: &str) -> anyhow::Result<()> {
    let mut out = sink
        .lock()
        .map_err(|_| anyhow::anyhow!("console writer poisoned"))?;
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}

impl Plugin for ConsolePlugin {
    fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
        let sink = Arc::clone(&self.sink);
        ctx.subscribe_fn(names::OUTPUT, move |e: &Event| write_line(&sink, &render(&e.payload)));

        let sink = Arc::clone(&self.sink);
        ctx.subscribe_fn(names::SYSTEM_STARTUP, move |_| write_line(&sink, "System started"));
        self.ctx = Some(ctx);
        Ok(())
    }

    // the console goes away before `system_shutdown` is published
    fn shutdown(&mut self) -> Result<(), PluginError> {
        let closing = self
            .ctx
            .take()
            .is_some_and(|ctx| ctx.lifecycle().is_cancelled());
        if closing {
            write_line(&self.sink, "System shutting down")?;
        }
        Ok(())
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::new(names::OUTPUT, "Show a message to the user").param("text", "str")]
    }
}
