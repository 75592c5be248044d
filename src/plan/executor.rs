use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use autopilot_plugin::{EventBus, event::names};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use super::{Action, Plan};

/// Executes one kind of action directly instead of publishing it.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, action: &Action) -> ExecutionResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub event: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub critical: bool,
    /// Event-specific fields such as command output.
    #[serde(default, flatten)]
    pub details: Map<String, Value>,
}

impl ExecutionResult {
    pub fn ok(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            success: true,
            error: None,
            critical: false,
            details: Map::new(),
        }
    }

    pub fn failed(event: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(event)
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// A failure that stops the remaining plan.
    pub fn is_fatal(&self) -> bool {
        !self.success && self.critical
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// One entry per attempted action; steps after a fatal failure are absent.
    pub results: Vec<ExecutionResult>,
    pub success_count: usize,
    /// Number of actions in the plan.
    pub total: usize,
    pub stopped_early: bool,
    pub elapsed_ms: u64,
}

impl ExecutionReport {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total as f64
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!("Completed {}/{} actions", self.success_count, self.total);
        if self.stopped_early {
            line.push_str(" (stopped after a critical failure)");
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    /// Pause between consecutive actions.
    pub step_delay: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(100),
        }
    }
}

/// Walks a plan in order, one action at a time.
pub struct PlanExecutor {
    bus: Arc<EventBus>,
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
    settings: ExecutorSettings,
}

impl PlanExecutor {
    pub fn new(bus: Arc<EventBus>, settings: ExecutorSettings) -> Self {
        Self {
            bus,
            handlers: DashMap::new(),
            settings,
        }
    }

    /// Routes `event` to `handler` instead of the bus.
    pub fn register_handler(&self, event: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(event.to_string(), handler);
    }

    pub fn unregister_handler(&self, event: &str) -> bool {
        self.handlers.remove(event).is_some()
    }

    #[instrument(skip_all, fields(actions = plan.len()))]
    pub async fn run(&self, plan: &Plan) -> ExecutionReport {
        let started = Instant::now();
        let total = plan.len();
        let mut report = ExecutionReport {
            total,
            ..Default::default()
        };
        self.say(format!("Executing plan with {total} actions"));

        for (index, action) in plan.iter().enumerate() {
            self.say(format!("[{}/{}] {}", index + 1, total, action.label()));
            let mut result = self.execute(action).await;
            if action.critical && !result.success {
                result.critical = true;
            }
            let fatal = result.is_fatal();
            if result.success {
                report.success_count += 1;
            } else {
                warn!(event = %action.event, error = ?result.error, "action failed");
                self.say(format!(
                    "Action `{}` failed: {}",
                    action.event,
                    result.error.as_deref().unwrap_or("unknown error")
                ));
            }
            report.results.push(result);
            if fatal {
                warn!(step = index + 1, "critical failure, skipping remaining actions");
                report.stopped_early = true;
                break;
            }
            if index + 1 < total && !self.settings.step_delay.is_zero() {
                tokio::time::sleep(self.settings.step_delay).await;
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(success = report.success_count, total, "plan finished");
        self.bus.publish(
            names::TASK_PLAN_COMPLETED,
            json!({ "actions_count": total, "success_count": report.success_count }),
        );
        self.say(report.summary());
        report
    }

    async fn execute(&self, action: &Action) -> ExecutionResult {
        let handler = self.handlers.get(&action.event).map(|h| Arc::clone(h.value()));
        if let Some(handler) = handler {
            return handler.execute(action).await;
        }
        let delivery = self.bus.publish(&action.event, action.data.clone());
        if delivery.delivered == 0 {
            ExecutionResult::failed(&action.event, format!("no handler for event `{}`", action.event))
        } else if !delivery.is_ok() {
            ExecutionResult::failed(&action.event, delivery.errors.join("; "))
        } else {
            ExecutionResult::ok(&action.event).with("handlers", delivery.delivered)
        }
    }

    fn say(&self, text: String) {
        self.bus.publish(names::OUTPUT, Value::String(text));
    }
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        f.debug_struct("PlanExecutor")
            .field("handlers", &handlers)
            .field("settings", &self.settings)
            .finish()
    }
}
