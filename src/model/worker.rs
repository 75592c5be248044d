use std::{path::Path, time::Duration};

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, instrument, warn};

use super::{GenerateOptions, GenerationError, GenerationParams, ModelError, ModelHandle, ModelLoader};
use crate::plan::{ParseError, Plan, parser};
use crate::prompt::plan_prompt;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Wall-clock limit for one generation.
    pub timeout: Duration,
    /// Attempts made by `generate_plan`, at least one.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Why no plan came out of the models.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("could not parse a plan: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("no models configured")]
    NoModels,
    #[error("no model produced a response")]
    NoResponse,
}

/// A loaded model plus the policy for calling it.
#[derive(Debug)]
pub struct ModelWorker {
    handle: ModelHandle,
    settings: WorkerSettings,
}

impl ModelWorker {
    pub async fn load(
        loader: &dyn ModelLoader,
        path: &Path,
        params: GenerationParams,
        settings: WorkerSettings,
    ) -> Result<Self, ModelError> {
        let handle = ModelHandle::open(loader, path, params).await?;
        Ok(Self { handle, settings })
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// Runs one generation, giving up after the configured timeout.
    ///
    /// On timeout the call returns at once and the in-flight request is
    /// aborted, releasing the worker for the next call. A backend doing
    /// blocking work may still finish in the background; its output is
    /// dropped. Calls on the same worker run one at a time.
    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, GenerationError> {
        let params = options.resolve(self.handle.params());
        let model = self.handle.model();
        let gate = self.handle.gate();
        let prompt = prompt.to_owned();
        let mut task = tokio::spawn(async move {
            let _turn = gate.lock_owned().await;
            model.complete(&prompt, &params).await
        });

        match timeout(self.settings.timeout, &mut task).await {
            Err(_) => {
                task.abort();
                warn!(model = %self.name(), limit = ?self.settings.timeout, "generation timed out");
                Err(GenerationError::Timeout(self.settings.timeout))
            }
            Ok(Err(join)) => Err(GenerationError::Aborted(join.to_string())),
            Ok(Ok(Err(err))) => Err(GenerationError::Failed(err.to_string())),
            Ok(Ok(Ok(text))) => Ok(text.trim().to_string()),
        }
    }

    /// Asks for a plan, retrying on generation or parse failures with a
    /// fixed pause. The error carries the last failure seen.
    pub async fn generate_plan(
        &self,
        system_prompt: &str,
        request: &str,
    ) -> Result<Plan, PlanningError> {
        self.draft_plan(system_prompt, request)
            .await
            .map(|(plan, _)| plan)
    }

    /// [`generate_plan`](Self::generate_plan) that also returns the text the
    /// plan was parsed from.
    #[instrument(skip_all, fields(model = %self.name()))]
    pub async fn draft_plan(
        &self,
        system_prompt: &str,
        request: &str,
    ) -> Result<(Plan, String), PlanningError> {
        let prompt = plan_prompt(system_prompt, request);
        let attempts = self.settings.max_retries.max(1);
        let mut last = PlanningError::NoResponse;

        for attempt in 1..=attempts {
            match self.generate(&prompt, &GenerateOptions::default()).await {
                Ok(text) => match parser::parse(&text) {
                    Ok(plan) => {
                        info!(attempt, actions = plan.len(), "plan generated");
                        return Ok((plan, text));
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "model output was not a plan");
                        last = err.into();
                    }
                },
                Err(err) => {
                    warn!(attempt, error = %err, "generation failed");
                    last = err.into();
                }
            }
            if attempt < attempts {
                sleep(self.settings.retry_delay).await;
            }
        }
        Err(last)
    }
}
