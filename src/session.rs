use std::{path::PathBuf, sync::Arc};

use autopilot_plugin::EventBus;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::model::{ModelLoader, ModelScanner, PlanningError};
use crate::orchestrator::{Draft, OrchestrationMode, Orchestrator};
use crate::plan::{ExecutionReport, Plan, PlanExecutor};
use crate::prompt::{CommandCatalog, PromptBuilder, PromptError};
use crate::runlog::RunLog;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("no active plan, use /plan <task> first")]
    NoPlan,
}

/// The request a plan was made for.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRequest {
    pub request: String,
    pub plan: Plan,
    pub model: String,
    pub raw_response: String,
}

/// One user's planning state: mode, the last plan and the machinery to make
/// and run plans.
pub struct ControlSession {
    mode: OrchestrationMode,
    orchestrator: Orchestrator,
    executor: Arc<PlanExecutor>,
    catalog: Arc<CommandCatalog>,
    prompts: PromptBuilder,
    runlog: Option<RunLog>,
    current: Option<PlannedRequest>,
}

impl ControlSession {
    pub fn new(
        mode: OrchestrationMode,
        orchestrator: Orchestrator,
        executor: Arc<PlanExecutor>,
        catalog: Arc<CommandCatalog>,
        runlog: Option<RunLog>,
    ) -> Result<Self, PromptError> {
        Ok(Self {
            mode,
            orchestrator,
            executor,
            catalog,
            prompts: PromptBuilder::new()?,
            runlog,
            current: None,
        })
    }

    /// Builds a session from the application settings: models are scanned
    /// from `models_dir`, plans run on `bus` and runs are logged under
    /// `data_dir` (logging is skipped if that directory cannot be created).
    pub fn from_config(
        config: &AppConfig,
        loader: Arc<dyn ModelLoader>,
        bus: Arc<EventBus>,
        catalog: Arc<CommandCatalog>,
    ) -> Result<Self, PromptError> {
        let models = ModelScanner::new(&config.models_dir)
            .scan_filtered(&config.model_whitelist, &config.model_blacklist);
        if models.is_empty() {
            warn!(dir = %config.models_dir.display(), "no models found");
        } else {
            info!(count = models.len(), "models available");
        }
        let orchestrator = Orchestrator::new(loader, models, config.orchestrator_settings());
        let executor = Arc::new(PlanExecutor::new(bus, config.executor_settings()));
        let runlog = match RunLog::new(&config.data_dir) {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(error = %err, "run log disabled");
                None
            }
        };
        Self::new(config.orchestration_mode, orchestrator, executor, catalog, runlog)
    }

    pub fn mode(&self) -> OrchestrationMode {
        self.mode
    }

    pub fn cross_iterations(&self) -> usize {
        self.orchestrator.settings().cross_rounds
    }

    /// Switches mode. `iterations` only applies to cross mode.
    pub fn set_mode(&mut self, mode: OrchestrationMode, iterations: Option<usize>) {
        self.mode = mode;
        if let (OrchestrationMode::Cross, Some(rounds)) = (mode, iterations) {
            self.orchestrator.set_cross_rounds(rounds);
        }
        info!(%mode, rounds = self.cross_iterations(), "orchestration mode changed");
    }

    pub fn models(&self) -> &[PathBuf] {
        self.orchestrator.models()
    }

    pub fn catalog(&self) -> &Arc<CommandCatalog> {
        &self.catalog
    }

    pub fn runlog(&self) -> Option<&RunLog> {
        self.runlog.as_ref()
    }

    pub fn current(&self) -> Option<&PlannedRequest> {
        self.current.as_ref()
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.current.as_ref().map(|c| &c.plan)
    }

    pub fn describe_plan(&self, detailed: bool) -> Option<String> {
        self.current_plan().map(|plan| plan.describe(detailed))
    }

    /// Makes a plan for `request` with the current mode and keeps it as the
    /// active plan. A failure clears the active plan.
    pub async fn request_plan(&mut self, request: &str) -> Result<&PlannedRequest, SessionError> {
        self.record(|log| log.log_prompt(request, &self.mode.to_string(), self.models()));
        let system_prompt = self.prompts.system_prompt(&self.catalog)?;

        match self.orchestrator.plan(self.mode, &system_prompt, request).await {
            Ok(Draft { plan, response }) => {
                info!(actions = plan.len(), model = %response.model, "plan ready");
                self.record(|log| log.log_successful_plan(request, &plan));
                Ok(&*self.current.insert(PlannedRequest {
                    request: request.to_string(),
                    plan,
                    model: response.model,
                    raw_response: response.text,
                }))
            }
            Err(err) => {
                self.current = None;
                let reason = err.to_string();
                self.record(|log| log.log_failed_plan(request, &reason));
                Err(err.into())
            }
        }
    }

    pub async fn execute_current(&self) -> Result<ExecutionReport, SessionError> {
        let current = self.current.as_ref().ok_or(SessionError::NoPlan)?;
        let report = self.executor.run(&current.plan).await;
        self.record(|log| log.log_execution(&current.request, &current.plan, &report));
        Ok(report)
    }

    /// Runs a plan handed in from outside, without touching the active plan.
    pub async fn execute(&self, plan: &Plan) -> ExecutionReport {
        let report = self.executor.run(plan).await;
        self.record(|log| log.log_execution("external plan", plan, &report));
        report
    }

    fn record<F>(&self, write: F)
    where
        F: FnOnce(&RunLog) -> Result<PathBuf, crate::runlog::RunLogError>,
    {
        if let Some(log) = &self.runlog {
            if let Err(err) = write(log) {
                warn!(error = %err, "could not write run log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GenerationParams, LanguageModel, ModelError, ModelLoader};
    use crate::orchestrator::OrchestratorSettings;
    use crate::plan::ExecutorSettings;
    use crate::runlog::RunLogKind;
    use async_trait::async_trait;
    use autopilot_plugin::{CommandSpec, EventBus};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Canned {
        reply: String,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LanguageModel for Canned {
        async fn complete(&self, prompt: &str, _: &GenerationParams) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    struct CannedLoader {
        reply: String,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ModelLoader for CannedLoader {
        async fn load(
            &self,
            _: &Path,
            _: &GenerationParams,
        ) -> Result<Arc<dyn LanguageModel>, ModelError> {
            Ok(Arc::new(Canned {
                reply: self.reply.clone(),
                prompts: Arc::clone(&self.prompts),
            }))
        }
    }

    struct Fixture {
        session: ControlSession,
        bus: Arc<EventBus>,
        prompts: Arc<Mutex<Vec<String>>>,
        _dir: TempDir,
    }

    fn fixture(reply: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("planner.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let loader = CannedLoader {
            reply: reply.to_string(),
            prompts: Arc::clone(&prompts),
        };
        let mut settings = OrchestratorSettings::default();
        settings.worker.max_retries = 1;
        settings.worker.timeout = Duration::from_secs(5);
        let orchestrator = Orchestrator::new(Arc::new(loader), vec![model], settings);
        let bus = Arc::new(EventBus::new());
        let executor = Arc::new(PlanExecutor::new(
            Arc::clone(&bus),
            ExecutorSettings {
                step_delay: Duration::ZERO,
            },
        ));
        let catalog = Arc::new(CommandCatalog::new());
        catalog.register("notes", vec![CommandSpec::new("note_add", "Add a note")]);
        let runlog = RunLog::new(dir.path().join("data")).unwrap();
        let session = ControlSession::new(
            OrchestrationMode::Single,
            orchestrator,
            executor,
            catalog,
            Some(runlog),
        )
        .unwrap();
        Fixture {
            session,
            bus,
            prompts,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn plans_with_the_catalog_in_the_prompt_and_logs_it() {
        let mut fx = fixture(r#"[{"event": "note_add", "data": {"text": "milk"}, "description": "Remember milk"}]"#);

        let planned = fx.session.request_plan("remember to buy milk").await.unwrap();
        assert_eq!(planned.plan.len(), 1);
        assert_eq!(planned.model, "planner.gguf");

        let prompt = fx.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("NOTES COMMANDS:"));
        assert!(prompt.ends_with("User request: remember to buy milk\n\nAnswer (JSON):"));
        assert_eq!(
            fx.session.describe_plan(false).unwrap(),
            fx.session.current_plan().unwrap().describe(false)
        );

        let log = fx.session.runlog().unwrap();
        assert_eq!(log.recent(Some(RunLogKind::Prompt), 5).len(), 1);
        assert_eq!(log.recent(Some(RunLogKind::SuccessfulPlan), 5).len(), 1);
    }

    #[tokio::test]
    async fn failed_planning_clears_the_active_plan() {
        let mut fx = fixture(r#"[{"event": "note_add", "data": {}}]"#);
        fx.session.request_plan("first").await.unwrap();
        assert!(fx.session.current_plan().is_some());

        let mut broken = fixture("sorry, no idea");
        let err = broken.session.request_plan("second").await.unwrap_err();
        assert!(matches!(err, SessionError::Planning(PlanningError::Parse(_))));
        assert!(broken.session.current_plan().is_none());
        assert_eq!(
            broken.session.runlog().unwrap().recent(Some(RunLogKind::FailedPlan), 5).len(),
            1
        );
    }

    #[tokio::test]
    async fn executes_the_active_plan_over_the_bus() {
        let mut fx = fixture(r#"[{"event": "note_add", "data": {"text": "milk"}}]"#);
        let notes = Arc::new(Mutex::new(Vec::new()));
        {
            let notes = Arc::clone(&notes);
            fx.bus.subscribe_fn("note_add", move |e| {
                notes.lock().unwrap().push(e.str_field("text").unwrap_or_default().to_string());
                Ok(())
            });
        }

        assert!(matches!(fx.session.execute_current().await, Err(SessionError::NoPlan)));
        fx.session.request_plan("milk").await.unwrap();
        let report = fx.session.execute_current().await.unwrap();

        assert_eq!(report.success_count, 1);
        assert_eq!(*notes.lock().unwrap(), vec!["milk"]);
        assert_eq!(
            fx.session.runlog().unwrap().recent(Some(RunLogKind::ExecutionResult), 5).len(),
            1
        );
    }

    #[test]
    fn iterations_only_change_in_cross_mode() {
        let mut fx = fixture("[]");
        fx.session.set_mode(OrchestrationMode::Multi, Some(5));
        assert_eq!(fx.session.cross_iterations(), 2);
        fx.session.set_mode(OrchestrationMode::Cross, Some(3));
        assert_eq!(fx.session.mode(), OrchestrationMode::Cross);
        assert_eq!(fx.session.cross_iterations(), 3);
    }
}
