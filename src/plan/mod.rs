pub mod executor;
pub mod parser;

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use executor::{ActionHandler, ExecutionReport, ExecutionResult, ExecutorSettings, PlanExecutor};
pub use parser::ParseError;

/// One step of a plan: an event to publish and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub event: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// A failure of this step stops the rest of the plan.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub critical: bool,
}

impl Action {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            description: None,
            critical: false,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.event)
    }
}

/// Ordered actions. Only the parser builds plans from model output, so a
/// plan reaching the executor has passed validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    actions: Vec<Action>,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.actions).unwrap_or(Value::Array(Vec::new()))
    }

    /// Numbered listing; `detailed` adds each step's payload.
    pub fn describe(&self, detailed: bool) -> String {
        let mut out = format!("Plan with {} actions:", self.len());
        for (i, action) in self.actions.iter().enumerate() {
            let _ = write!(out, "\n  {}. {}", i + 1, action.label());
            if detailed {
                let _ = write!(out, "\n     event: {}\n     data: {}", action.event, action.data);
            }
        }
        out
    }
}

impl From<Vec<Action>> for Plan {
    fn from(actions: Vec<Action>) -> Self {
        Self::new(actions)
    }
}

impl<'a> IntoIterator for &'a Plan {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialises_as_a_bare_array() {
        let plan = Plan::new(vec![
            Action::new("file_read", json!({"path": "/tmp/a"})).described("Read a"),
        ]);
        assert_eq!(
            plan.to_value(),
            json!([{"event": "file_read", "data": {"path": "/tmp/a"}, "description": "Read a"}])
        );
        let back: Plan = serde_json::from_value(plan.to_value()).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn describe_lists_labels_and_optional_payloads() {
        let plan = Plan::new(vec![
            Action::new("a", json!({})).described("first"),
            Action::new("b", json!({"k": 1})),
        ]);
        assert_eq!(plan.describe(false), "Plan with 2 actions:\n  1. first\n  2. b");
        assert!(plan.describe(true).contains("data: {\"k\":1}"));
    }
}
