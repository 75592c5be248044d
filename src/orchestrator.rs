//! Strategies for turning one prompt into one response using one or more
//! models.
//!
//! * `single` asks the first model.
//! * `multi` asks every model the same question and keeps one answer.
//! * `cross` runs several rounds where each model sees a preview of the
//!   previous round's answers and is asked to improve on them.
//!
//! Which answer is kept is decided by a [`ResponseSelector`]; the default
//! keeps the longest text, the first one seen on a tie.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{info, instrument, warn};

use crate::model::{
    GenerateOptions, GenerationParams, ModelError, ModelLoader, ModelWorker, PlanningError,
    WorkerSettings,
};
use crate::plan::{Plan, parser};
use crate::prompt::plan_prompt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OrchestrationMode {
    #[default]
    Single,
    Multi,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub model: String,
    pub text: String,
}

/// Picks the response that goes on to the parser.
pub trait ResponseSelector: Send + Sync {
    fn select<'a>(&self, responses: &'a [Response]) -> Option<&'a Response>;
}

/// Longest text wins; ties keep the earliest response.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongestResponse;

impl ResponseSelector for LongestResponse {
    fn select<'a>(&self, responses: &'a [Response]) -> Option<&'a Response> {
        longest_response(responses)
    }
}

pub fn longest_response(responses: &[Response]) -> Option<&Response> {
    let mut best: Option<&Response> = None;
    for candidate in responses {
        let longer = best.is_none_or(|b| candidate.text.chars().count() > b.text.chars().count());
        if longer {
            best = Some(candidate);
        }
    }
    best
}

/// Prompt for the next cross round: the original prompt, a bounded preview
/// of every answer so far, and an instruction to improve.
pub fn cross_prompt(prompt: &str, previous: &[Response], preview_chars: usize) -> String {
    let options: Vec<String> = previous
        .iter()
        .map(|r| {
            let preview: String = r.text.chars().take(preview_chars).collect();
            format!("Model {}: {preview}...", r.model)
        })
        .collect();
    format!(
        "{prompt}\n\nPrevious answer options:\n{}\n\nImprove your answer considering these options:",
        options.join("\n\n")
    )
}

/// A parsed plan together with the response it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub plan: Plan,
    pub response: Response,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub params: GenerationParams,
    pub worker: WorkerSettings,
    pub cross_rounds: usize,
    pub preview_chars: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            params: GenerationParams::default(),
            worker: WorkerSettings::default(),
            cross_rounds: 2,
            preview_chars: 500,
        }
    }
}

pub struct Orchestrator {
    loader: Arc<dyn ModelLoader>,
    models: Vec<PathBuf>,
    settings: OrchestratorSettings,
    selector: Arc<dyn ResponseSelector>,
}

impl Orchestrator {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        models: Vec<PathBuf>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            loader,
            models,
            settings,
            selector: Arc::new(LongestResponse),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn ResponseSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn models(&self) -> &[PathBuf] {
        &self.models
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn set_cross_rounds(&mut self, rounds: usize) {
        self.settings.cross_rounds = rounds.max(1);
    }

    async fn load(&self, path: &Path) -> Result<ModelWorker, ModelError> {
        ModelWorker::load(
            self.loader.as_ref(),
            path,
            self.settings.params.clone(),
            self.settings.worker.clone(),
        )
        .await
    }

    /// Produces a plan. Single mode goes through the worker's retry loop;
    /// the other modes parse the selected response once.
    #[instrument(skip_all, fields(%mode, models = self.models.len()))]
    pub async fn plan(
        &self,
        mode: OrchestrationMode,
        system_prompt: &str,
        request: &str,
    ) -> Result<Draft, PlanningError> {
        match mode {
            OrchestrationMode::Single => {
                let path = self.models.first().ok_or(PlanningError::NoModels)?;
                let worker = self.load(path).await?;
                let (plan, text) = worker.draft_plan(system_prompt, request).await?;
                Ok(Draft {
                    plan,
                    response: Response {
                        model: worker.name().to_string(),
                        text,
                    },
                })
            }
            OrchestrationMode::Multi | OrchestrationMode::Cross => {
                let response = self.respond(mode, &plan_prompt(system_prompt, request)).await?;
                info!(model = %response.model, chars = response.text.len(), "parsing selected response");
                let plan = parser::parse(&response.text)?;
                Ok(Draft { plan, response })
            }
        }
    }

    /// Produces one raw response according to `mode`.
    pub async fn respond(
        &self,
        mode: OrchestrationMode,
        prompt: &str,
    ) -> Result<Response, PlanningError> {
        if self.models.is_empty() {
            return Err(PlanningError::NoModels);
        }
        match mode {
            OrchestrationMode::Single => self.single(prompt).await,
            OrchestrationMode::Multi => {
                let responses = self.multi(prompt).await?;
                self.pick(&responses)
            }
            OrchestrationMode::Cross => self.cross(prompt).await,
        }
    }

    fn pick(&self, responses: &[Response]) -> Result<Response, PlanningError> {
        self.selector
            .select(responses)
            .cloned()
            .ok_or(PlanningError::NoResponse)
    }

    async fn single(&self, prompt: &str) -> Result<Response, PlanningError> {
        let path = self.models.first().ok_or(PlanningError::NoModels)?;
        let worker = self.load(path).await?;
        let text = worker.generate(prompt, &GenerateOptions::default()).await?;
        Ok(Response {
            model: worker.name().to_string(),
            text,
        })
    }

    /// Every model answers the same prompt concurrently; all of them stay
    /// loaded until the last answer is in.
    async fn multi(&self, prompt: &str) -> Result<Vec<Response>, PlanningError> {
        let mut workers = Vec::with_capacity(self.models.len());
        let mut last_error = None;
        for path in &self.models {
            match self.load(path).await {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    warn!(model = %path.display(), error = %err, "skipping model");
                    last_error = Some(err);
                }
            }
        }
        if workers.is_empty() {
            return Err(last_error.map(PlanningError::from).unwrap_or(PlanningError::NoModels));
        }

        let options = GenerateOptions::default();
        let outcomes = join_all(workers.iter().map(|w| w.generate(prompt, &options))).await;
        let responses = workers
            .iter()
            .zip(outcomes)
            .filter_map(|(worker, outcome)| match outcome {
                Ok(text) => Some(Response {
                    model: worker.name().to_string(),
                    text,
                }),
                Err(err) => {
                    warn!(model = %worker.name(), error = %err, "model produced no answer");
                    None
                }
            })
            .collect();
        Ok(responses)
    }

    /// Rounds of refinement. Each model is loaded for its own generation and
    /// released straight after, so only one is resident at a time.
    async fn cross(&self, prompt: &str) -> Result<Response, PlanningError> {
        let rounds = self.settings.cross_rounds.max(1);
        let options = GenerateOptions::default();
        let mut round_prompt = prompt.to_string();
        let mut last_round = Vec::new();

        for round in 1..=rounds {
            let mut responses = Vec::new();
            for path in &self.models {
                let worker = match self.load(path).await {
                    Ok(worker) => worker,
                    Err(err) => {
                        warn!(round, model = %path.display(), error = %err, "skipping model");
                        continue;
                    }
                };
                match worker.generate(&round_prompt, &options).await {
                    Ok(text) => responses.push(Response {
                        model: worker.name().to_string(),
                        text,
                    }),
                    Err(err) => warn!(round, model = %worker.name(), error = %err, "no answer"),
                }
            }
            info!(round, answers = responses.len(), "cross round finished");
            if round < rounds && !responses.is_empty() {
                round_prompt = cross_prompt(prompt, &responses, self.settings.preview_chars);
            }
            last_round = responses;
        }
        self.pick(&last_round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LanguageModel;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Record {
        loads: AtomicUsize,
        releases: AtomicUsize,
        prompts: Mutex<Vec<(String, String)>>,
    }

    struct Echo {
        name: String,
        reply: Option<String>,
        record: Arc<Record>,
    }

    #[async_trait]
    impl LanguageModel for Echo {
        async fn complete(&self, prompt: &str, _: &GenerationParams) -> anyhow::Result<String> {
            self.record
                .prompts
                .lock()
                .unwrap()
                .push((self.name.clone(), prompt.to_string()));
            self.reply.clone().ok_or_else(|| anyhow::anyhow!("model down"))
        }

        fn release(&self) {
            self.record.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Replies keyed by file name; a `None` reply fails every generation.
    struct FixedLoader {
        replies: HashMap<String, Option<String>>,
        record: Arc<Record>,
    }

    #[async_trait]
    impl ModelLoader for FixedLoader {
        async fn load(
            &self,
            path: &Path,
            _: &GenerationParams,
        ) -> Result<Arc<dyn LanguageModel>, ModelError> {
            self.record.loads.fetch_add(1, Ordering::SeqCst);
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            let reply = self.replies.get(&name).cloned().flatten();
            Ok(Arc::new(Echo {
                name,
                reply,
                record: Arc::clone(&self.record),
            }))
        }
    }

    fn setup(replies: &[(&str, Option<&str>)]) -> (Orchestrator, Arc<Record>, TempDir) {
        let dir = TempDir::new().unwrap();
        let record = Arc::new(Record::default());
        let mut paths = Vec::new();
        let mut map = HashMap::new();
        for (name, reply) in replies {
            let path = dir.path().join(name);
            std::fs::write(&path, b"GGUF").unwrap();
            paths.push(path);
            map.insert(name.to_string(), reply.map(str::to_string));
        }
        let loader = FixedLoader {
            replies: map,
            record: Arc::clone(&record),
        };
        let orchestrator = Orchestrator::new(Arc::new(loader), paths, OrchestratorSettings::default());
        (orchestrator, record, dir)
    }

    fn response(model: &str, text: &str) -> Response {
        Response {
            model: model.into(),
            text: text.into(),
        }
    }

    #[test]
    fn longest_wins_and_ties_keep_first() {
        let responses = vec![response("A", "short"), response("B", "a longer response text")];
        assert_eq!(longest_response(&responses).unwrap().model, "B");

        let tied = vec![response("A", "same"), response("B", "size")];
        assert_eq!(longest_response(&tied).unwrap().model, "A");
        assert!(longest_response(&[]).is_none());
    }

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!("CROSS".parse::<OrchestrationMode>().unwrap(), OrchestrationMode::Cross);
        assert_eq!(OrchestrationMode::Multi.to_string(), "multi");
        assert!("parallel".parse::<OrchestrationMode>().is_err());
    }

    #[test]
    fn cross_prompt_previews_each_answer() {
        let long = "x".repeat(600);
        let prompt = cross_prompt("Q", &[response("a.gguf", "hi"), response("b.gguf", &long)], 500);
        let expected_b = format!("Model b.gguf: {}...", "x".repeat(500));
        assert_eq!(
            prompt,
            format!(
                "Q\n\nPrevious answer options:\nModel a.gguf: hi...\n\n{expected_b}\n\nImprove your answer considering these options:"
            )
        );
    }

    #[tokio::test]
    async fn multi_picks_the_longest_answer() {
        let (orch, record, _dir) = setup(&[
            ("A.gguf", Some("short")),
            ("B.gguf", Some("a longer response text")),
            ("C.gguf", None),
        ]);

        let chosen = orch.respond(OrchestrationMode::Multi, "question").await.unwrap();

        assert_eq!(chosen, response("B.gguf", "a longer response text"));
        assert_eq!(record.loads.load(Ordering::SeqCst), 3);
        assert_eq!(record.releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cross_feeds_previous_round_and_releases_every_load() {
        let (orch, record, _dir) = setup(&[("a.gguf", Some("alpha")), ("b.gguf", Some("beta!!"))]);

        let chosen = orch.respond(OrchestrationMode::Cross, "Q").await.unwrap();

        assert_eq!(chosen.model, "b.gguf");
        assert_eq!(record.loads.load(Ordering::SeqCst), 4);
        assert_eq!(record.releases.load(Ordering::SeqCst), 4);
        let prompts = record.prompts.lock().unwrap();
        assert_eq!(prompts[0].1, "Q");
        assert!(prompts[2].1.starts_with("Q\n\nPrevious answer options:\nModel a.gguf: alpha...\n\nModel b.gguf: beta!!..."));
    }

    #[tokio::test]
    async fn cross_without_answers_is_an_error() {
        let (orch, _, _dir) = setup(&[("a.gguf", None)]);
        let err = orch.respond(OrchestrationMode::Cross, "Q").await.unwrap_err();
        assert!(matches!(err, PlanningError::NoResponse));
    }

    #[tokio::test]
    async fn single_uses_first_model_and_plan_parses() {
        let (orch, record, _dir) = setup(&[
            ("first.gguf", Some(r#"```json
[{"event": "file_read", "data": {"path": "/etc/hostname"}}]
```"#)),
            ("second.gguf", Some("unused")),
        ]);

        let draft = orch
            .plan(OrchestrationMode::Single, "SYS", "read the hostname")
            .await
            .unwrap();

        assert_eq!(draft.plan.actions()[0].event, "file_read");
        assert_eq!(draft.response.model, "first.gguf");
        assert!(draft.response.text.starts_with("```json"));
        assert_eq!(record.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multi_plan_reports_parse_failures() {
        let (orch, _, _dir) = setup(&[("a.gguf", Some("I cannot help with that"))]);
        let err = orch.plan(OrchestrationMode::Multi, "SYS", "R").await.unwrap_err();
        assert!(matches!(err, PlanningError::Parse(_)));
    }

    #[tokio::test]
    async fn no_models_is_reported() {
        let (orch, _, _dir) = setup(&[]);
        assert!(matches!(
            orch.respond(OrchestrationMode::Single, "Q").await,
            Err(PlanningError::NoModels)
        ));
    }
}
