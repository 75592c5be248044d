use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Event names with a payload contract shared by the host and its plugins.
pub mod names {
    pub const PLUGIN_REGISTERED: &str = "plugin_registered";
    pub const PLUGIN_REMOVED: &str = "plugin_removed";
    pub const SYSTEM_STARTUP: &str = "system_startup";
    pub const SYSTEM_SHUTDOWN: &str = "system_shutdown";
    pub const USER_INPUT: &str = "user_input";
    pub const OUTPUT: &str = "output";
    pub const TASK_PLAN_REQUEST: &str = "task_plan_request";
    pub const TASK_PLAN_GENERATED: &str = "task_plan_generated";
    pub const TASK_EXECUTE: &str = "task_execute";
    pub const TASK_PLAN_COMPLETED: &str = "task_plan_completed";
    pub const PLUGIN_COMMANDS_REGISTERED: &str = "plugin_commands_registered";
    pub const REQUEST_PLUGIN_COMMANDS: &str = "request_plugin_commands";
}

/// A named event with an untyped payload. `Value::Null` means "no payload".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Convenience for payload-less events such as `system_startup`.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    /// Text carried by an `output` or `user_input` event: either a plain
    /// string or a `{type, text}` object.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get("text").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Reads a string field from an object payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Structured `output` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl OutputMessage {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
        }
    }

    pub fn into_value(self) -> Value {
        json!({ "type": self.kind, "text": self.text })
    }
}
