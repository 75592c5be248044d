use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::plan::{ExecutionReport, Plan};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunLogKind {
    Prompt,
    SuccessfulPlan,
    FailedPlan,
    ExecutionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: RunLogKind,
    pub prompt: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("run log I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run log encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes one JSON file per prompt, plan outcome and execution report.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RunLogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RunLogError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_prompt(&self, prompt: &str, mode: &str, models: &[PathBuf]) -> Result<PathBuf, RunLogError> {
        let names: Vec<String> = models
            .iter()
            .map(|m| crate::model::backend::display_name(m))
            .collect();
        self.write(
            RunLogKind::Prompt,
            prompt,
            json!({ "mode": mode, "models_count": names.len(), "models": names }),
        )
    }

    pub fn log_successful_plan(&self, prompt: &str, plan: &Plan) -> Result<PathBuf, RunLogError> {
        self.write(
            RunLogKind::SuccessfulPlan,
            prompt,
            json!({ "plan": plan, "actions_count": plan.len(), "status": "success" }),
        )
    }

    pub fn log_failed_plan(&self, prompt: &str, reason: &str) -> Result<PathBuf, RunLogError> {
        self.write(
            RunLogKind::FailedPlan,
            prompt,
            json!({ "status": "failed", "reason": reason }),
        )
    }

    pub fn log_execution(
        &self,
        prompt: &str,
        plan: &Plan,
        report: &ExecutionReport,
    ) -> Result<PathBuf, RunLogError> {
        self.write(
            RunLogKind::ExecutionResult,
            prompt,
            json!({
                "plan": plan,
                "execution_results": report.results,
                "success_count": report.success_count,
                "total_actions": report.total,
                "success_rate": report.success_rate(),
                "stopped_early": report.stopped_early,
            }),
        )
    }

    fn write(&self, kind: RunLogKind, prompt: &str, fields: Value) -> Result<PathBuf, RunLogError> {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let entry = RunLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            prompt: prompt.to_string(),
            fields,
        };
        let file = format!(
            "{}_{}_{:04}.json",
            kind.as_ref(),
            entry.timestamp.format("%Y%m%d_%H%M%S"),
            entry.id.as_u128() % 10_000
        );
        let path = self.dir.join(file);
        let body = serde_json::to_string_pretty(&entry)?;
        fs::write(&path, body).map_err(|source| RunLogError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "run log written");
        Ok(path)
    }

    /// Newest entries first, optionally of a single kind.
    pub fn recent(&self, kind: Option<RunLogKind>, limit: usize) -> Vec<RunLogEntry> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut logs: Vec<RunLogEntry> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| {
                let text = fs::read_to_string(&p).ok()?;
                match serde_json::from_str::<RunLogEntry>(&text) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        warn!(path = %p.display(), error = %err, "unreadable run log");
                        None
                    }
                }
            })
            .filter(|entry| kind.is_none_or(|k| entry.kind == k))
            .collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Action, ExecutionResult};
    use tempfile::TempDir;

    #[test]
    fn writes_one_file_per_record_with_kind_prefix() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(dir.path().join("data")).unwrap();

        let path = log
            .log_prompt("list files", "multi", &[PathBuf::from("m/a.gguf"), PathBuf::from("m/b.gguf")])
            .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("prompt_"));
        assert!(name.ends_with(".json"));
        let entry: RunLogEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(entry.kind, RunLogKind::Prompt);
        assert_eq!(entry.fields["models"], json!(["a.gguf", "b.gguf"]));
        assert_eq!(entry.fields["models_count"], json!(2));
    }

    #[test]
    fn recent_filters_by_kind_and_limits() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(dir.path()).unwrap();
        let plan = Plan::new(vec![Action::new("x", json!({}))]);
        let report = ExecutionReport {
            results: vec![ExecutionResult::ok("x")],
            success_count: 1,
            total: 1,
            ..Default::default()
        };

        log.log_successful_plan("one", &plan).unwrap();
        log.log_failed_plan("two", "no array").unwrap();
        log.log_execution("one", &plan, &report).unwrap();

        assert_eq!(log.recent(None, 10).len(), 3);
        assert_eq!(log.recent(None, 2).len(), 2);
        let executions = log.recent(Some(RunLogKind::ExecutionResult), 10);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].fields["success_rate"], json!(1.0));
        assert_eq!(log.recent(Some(RunLogKind::FailedPlan), 10)[0].prompt, "two");
    }
}
