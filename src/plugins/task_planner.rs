//! Bridges planning events and slash commands to a [`ControlSession`].
//!
//! Handlers on the bus are synchronous, so every model call and plan run is
//! spawned on the runtime handed to the plugin. Spawned work stops when the
//! plugin shuts down or the application starts shutting down.

use std::{
    future::Future,
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Weak},
};

use autopilot_plugin::{
    CommandSpec, Event, Plugin, PluginContext, PluginError,
    event::{OutputMessage, names},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{runtime::Handle, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::logger::instrument_request;
use crate::model::{ModelLoader, backend::display_name};
use crate::orchestrator::OrchestrationMode;
use crate::plan::{ExecutionReport, Plan, parser};
use crate::prompt::CommandCatalog;
use crate::runlog::{RunLog, RunLogKind};
use crate::session::ControlSession;

const RECENT_LOGS: usize = 5;

#[derive(Debug, Deserialize)]
struct PlanRequest {
    request: String,
    #[serde(default)]
    auto_execute: bool,
}

/// Payload of `plugin_commands_registered`.
#[derive(Debug, Deserialize)]
pub struct CommandsAdvertised {
    pub plugin_name: String,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

pub struct TaskPlannerPlugin {
    loader: Arc<dyn ModelLoader>,
    runtime: Handle,
    token: Option<CancellationToken>,
}

impl TaskPlannerPlugin {
    pub fn new(loader: Arc<dyn ModelLoader>, runtime: Handle) -> Self {
        Self {
            loader,
            runtime,
            token: None,
        }
    }
}

struct Planner {
    ctx: Weak<PluginContext>,
    session: Mutex<ControlSession>,
    catalog: Arc<CommandCatalog>,
    models_dir: PathBuf,
    runtime: Handle,
    token: CancellationToken,
}

impl Planner {
    fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!("planner task cancelled"),
                _ = work => {}
            }
        });
    }

    fn say(&self, text: impl Into<String>) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.output(text);
        }
    }

    fn report(&self, kind: &str, text: impl Into<String>) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.publish(names::OUTPUT, OutputMessage::new(kind, text).into_value());
        }
    }

    fn publish(&self, event: &str, payload: Value) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.publish(event, payload);
        }
    }

    async fn plan(&self, request: String, auto_execute: bool) {
        let mut session = self.session.lock().await;
        self.say(format!("Planning ({} mode): {request}", session.mode()));

        let generated = instrument_request("plan", session.request_plan(&request))
            .await
            .map(|planned| {
                (
                    planned.plan.clone(),
                    planned.raw_response.clone(),
                    planned.model.clone(),
                )
            });
        let (plan, raw_response, model) = match generated {
            Ok(generated) => generated,
            Err(err) => {
                self.report("error", format!("Planning failed: {err}"));
                return;
            }
        };

        info!(actions = plan.len(), %model, "plan generated");
        self.report("plan", plan.describe(false));
        self.publish(
            names::TASK_PLAN_GENERATED,
            json!({ "request": request, "plan": plan.to_value(), "raw_response": raw_response }),
        );

        if auto_execute {
            match session.execute_current().await {
                Ok(report) => self.finish(&report),
                Err(err) => self.report("error", err.to_string()),
            }
        } else {
            self.say("Use /execute to run it.");
        }
    }

    async fn execute_current(&self) {
        let session = self.session.lock().await;
        match instrument_request("execute", session.execute_current()).await {
            Ok(report) => self.finish(&report),
            Err(err) => self.report("error", err.to_string()),
        }
    }

    async fn execute_external(&self, plan: Plan) {
        let session = self.session.lock().await;
        let report = session.execute(&plan).await;
        self.finish(&report);
    }

    fn finish(&self, report: &ExecutionReport) {
        for (i, result) in report.results.iter().enumerate() {
            if let Some(error) = result.error.as_deref() {
                self.report("error", format!("Step {} ({}) failed: {error}", i + 1, result.event));
            }
        }
        self.report("result", report.summary());
        self.publish(
            names::TASK_PLAN_COMPLETED,
            json!({
                "actions_count": report.total,
                "success_count": report.success_count,
                "stopped_early": report.stopped_early,
            }),
        );
    }

    async fn show(&self, detailed: bool) {
        let session = self.session.lock().await;
        match session.describe_plan(detailed) {
            Some(text) => self.say(text),
            None => self.say("No active plan, use /plan <task> first"),
        }
    }

    async fn mode(&self, args: Vec<String>) {
        let mut session = self.session.lock().await;
        let Some(requested) = args.first() else {
            self.say(format!(
                "Mode: {} (cross iterations: {})",
                session.mode(),
                session.cross_iterations()
            ));
            return;
        };
        let mode = match OrchestrationMode::from_str(requested) {
            Ok(mode) => mode,
            Err(_) => {
                self.report("error", format!("Unknown mode `{requested}`, use single, multi or cross"));
                return;
            }
        };
        let iterations = match args.get(1).map(|n| n.parse::<usize>()) {
            Some(Ok(n)) if n > 0 => Some(n),
            Some(_) => {
                self.report("error", "Iterations must be a positive number");
                return;
            }
            None => None,
        };
        session.set_mode(mode, iterations);
        self.say(format!(
            "Mode set to {} (cross iterations: {})",
            session.mode(),
            session.cross_iterations()
        ));
    }

    async fn models(&self) {
        let session = self.session.lock().await;
        let models = session.models();
        if models.is_empty() {
            self.say(format!("No models found in {}", self.models_dir.display()));
            return;
        }
        let list: Vec<String> = models
            .iter()
            .enumerate()
            .map(|(i, path)| format!("  {}. {}", i + 1, display_name(path)))
            .collect();
        self.say(format!("Models:\n{}", list.join("\n")));
    }

    async fn logs(&self, kind: Option<String>) {
        let kind = match kind.map(|k| RunLogKind::from_str(&k)) {
            Some(Ok(kind)) => Some(kind),
            Some(Err(_)) => {
                self.report(
                    "error",
                    "Unknown log kind, use prompt, successful_plan, failed_plan or execution_result",
                );
                return;
            }
            None => None,
        };
        let session = self.session.lock().await;
        let Some(log) = session.runlog() else {
            self.say("Run log is disabled");
            return;
        };
        let entries = log.recent(kind, RECENT_LOGS);
        if entries.is_empty() {
            self.say("No log entries");
            return;
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|e| {
                format!(
                    "  {} [{}] {}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.kind,
                    e.prompt
                )
            })
            .collect();
        self.say(format!("Recent log entries:\n{}", lines.join("\n")));
    }

    /// Handles one `/command` line. Returns false for lines that are not
    /// planner commands.
    fn command(self: &Arc<Self>, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return false;
        };
        let args: Vec<String> = parts.map(String::from).collect();
        let me = Arc::clone(self);
        match verb {
            "/plan" => {
                let request = line.trim_start_matches("/plan").trim().to_string();
                if request.is_empty() {
                    self.say("Usage: /plan <task description>");
                } else {
                    self.spawn(async move { me.plan(request, false).await });
                }
            }
            "/show" => {
                let detailed = args.iter().any(|a| a == "-d" || a == "--detailed");
                self.spawn(async move { me.show(detailed).await });
            }
            "/execute" => self.spawn(async move { me.execute_current().await }),
            "/mode" => self.spawn(async move { me.mode(args).await }),
            "/models" => self.spawn(async move { me.models().await }),
            "/logs" => {
                let kind = args.into_iter().next();
                self.spawn(async move { me.logs(kind).await });
            }
            _ => return false,
        }
        true
    }
}

impl Plugin for TaskPlannerPlugin {
    fn init(&mut self, ctx: Arc<PluginContext>) -> Result<(), PluginError> {
        let config: AppConfig = serde_json::from_value(ctx.config().clone())?;

        let catalog = Arc::new(CommandCatalog::new());
        let from_files = catalog.load_dir(&config.data_dir.join("commands"));
        debug!(from_files, "command descriptions read from disk");

        let session = ControlSession::from_config(
            &config,
            Arc::clone(&self.loader),
            Arc::clone(ctx.bus()),
            Arc::clone(&catalog),
        )
        .map_err(|e| PluginError::Config(e.to_string()))?;
        let token = ctx.lifecycle().token();
        self.token = Some(token.clone());
        let planner = Arc::new(Planner {
            ctx: Arc::downgrade(&ctx),
            session: Mutex::new(session),
            catalog,
            models_dir: config.models_dir.clone(),
            runtime: self.runtime.clone(),
            token,
        });

        let p = Arc::clone(&planner);
        ctx.subscribe_fn(names::TASK_PLAN_REQUEST, move |event: &Event| {
            let request: PlanRequest = serde_json::from_value(event.payload.clone())?;
            let me = Arc::clone(&p);
            p.spawn(async move { me.plan(request.request, request.auto_execute).await });
            Ok(())
        });

        let p = Arc::clone(&planner);
        ctx.subscribe_fn(names::TASK_EXECUTE, move |event: &Event| {
            let me = Arc::clone(&p);
            match event.payload.get("plan") {
                Some(plan) => {
                    let plan = parser::from_value(plan.clone())?;
                    p.spawn(async move { me.execute_external(plan).await });
                }
                None => p.spawn(async move { me.execute_current().await }),
            }
            Ok(())
        });

        let p = Arc::clone(&planner);
        ctx.subscribe_fn(names::PLUGIN_COMMANDS_REGISTERED, move |event: &Event| {
            let advertised: CommandsAdvertised = serde_json::from_value(event.payload.clone())?;
            debug!(plugin = %advertised.plugin_name, count = advertised.commands.len(), "commands advertised");
            p.catalog.register(&advertised.plugin_name, advertised.commands);
            Ok(())
        });

        let p = Arc::clone(&planner);
        ctx.subscribe_fn(names::PLUGIN_REMOVED, move |event: &Event| {
            if let Some(name) = event.str_field("name") {
                p.catalog.remove(name);
            }
            Ok(())
        });

        let p = Arc::clone(&planner);
        ctx.subscribe_fn(names::USER_INPUT, move |event: &Event| {
            if let Some(line) = event.text().map(str::trim) {
                if line.starts_with('/') && !p.command(line) {
                    p.say(format!("Unknown command: {line}"));
                }
            }
            Ok(())
        });

        ctx.publish(names::REQUEST_PLUGIN_COMMANDS, json!({}));
        info!(commands = planner.catalog.len(), "task planner ready");
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), PluginError> {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        Ok(())
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new(names::TASK_PLAN_REQUEST, "Plan a follow-up task")
                .param("request", "str")
                .param("auto_execute", "bool"),
        ]
    }
}
