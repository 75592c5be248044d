use std::sync::Arc;

use autopilot_plugin::{Event, Plugin, PluginContext, PluginError, event::names};
use serde_json::Value;
use tracing::debug;

const USAGE: &str = "\
Debug: debug <event> [data]
  data starting with { or [ is parsed as JSON,
  true/false as a bool, digits as an integer,
  a decimal as a float, anything else as a string.
  Example: debug output {\"type\": \"info\", \"text\": \"hi\"}";

const PREVIEW_CHARS: usize = 100;

/// Publishes arbitrary events typed at the console.
#[derive(Default)]
pub struct DebugPlugin;

impl DebugPlugin {
    pub fn new() -> Self {
        Self
    }
}

/// Turns the text after the event name into a payload.
pub fn infer_payload(raw: &str) -> Result<Value, serde_json::Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    if raw.starts_with('{') || raw.starts_with('[') {
        return serde_json::from_str(raw);
    }
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(Value::from(n));
        }
    }
    if raw.contains('.') {
        if let Some(n) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Ok(Value::Number(n));
        }
    }
    Ok(Value::String(raw.to_string()))
}

fn preview(payload: &Value) -> String {
    let text = payload.to_string();
    if text.chars().count() > PREVIEW_CHARS {
        let cut: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        text
    }
}

fn handle(ctx: &PluginContext, event: &Event) -> anyhow::Result<()> {
    let Some(rest) = event
        .text()
        .map(str::trim)
        .and_then(|line| line.strip_prefix("debug"))
    else {
        return Ok(());
    };
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return Ok(());
    }

    let rest = rest.trim();
    let (target, raw) = match rest.split_once(char::is_whitespace) {
        Some((target, raw)) => (target, raw),
        None => (rest, ""),
    };
    if target.is_empty() || target == "help" {
        ctx.output(USAGE);
        return Ok(());
    }

    let payload = match infer_payload(raw) {
        Ok(payload) => payload,
        Err(e) => {
            ctx.output(format!("Invalid JSON: {e}"));
            Value::String(raw.trim().to_string())
        }
    };
    debug!(event = %target, "publishing by hand");
    let shown = preview(&payload);
    ctx.publish(target, payload);
    ctx.output(format!("Published '{target}': {shown}"));
    Ok(())
}

impl Plugin for DebugPlugin {
    fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
        let weak = Arc::downgrade(&ctx);
        ctx.subscribe_fn(names::USER_INPUT, move |event| match weak.upgrade() {
            Some(ctx) => handle(&ctx, event),
            None => Ok(()),
        });

        let show_usage = ctx
            .section("debug")
            .and_then(|s| s.get("debug_mode"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if show_usage {
            let weak = Arc::downgrade(&ctx);
            ctx.subscribe_fn(names::SYSTEM_STARTUP, move |_| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.output(USAGE);
                }
                Ok(())
            });
        }
        Ok(())
    }
}
