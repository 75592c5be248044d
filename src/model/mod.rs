//! Language model access: loading weights, bounded generation and the
//! retrying plan generator built on top of it.

pub mod backend;
pub mod ollama;
pub mod scanner;
pub mod worker;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::{LanguageModel, ModelHandle, ModelLoader, verify_weights};
pub use ollama::OllamaLoader;
pub use scanner::ModelScanner;
pub use worker::{ModelWorker, PlanningError, WorkerSettings};

/// Sampling and runtime parameters a model is loaded with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_gpu_layers: u32,
    /// Negative means "pick one at random".
    pub seed: i64,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.5,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.0,
            n_ctx: 8192,
            n_batch: 512,
            n_gpu_layers: 0,
            seed: -1,
            stop: Vec::new(),
        }
    }
}

/// Per-call overrides on top of the loaded [`GenerationParams`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl GenerateOptions {
    pub fn resolve(&self, base: &GenerationParams) -> GenerationParams {
        let mut params = base.clone();
        if let Some(max_tokens) = self.max_tokens {
            params.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            params.temperature = temperature;
        }
        if let Some(stop) = &self.stop {
            params.stop = stop.clone();
        }
        params
    }
}

/// Load failures. Fatal to the load attempt only.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("model file {} is not usable: {reason}", .path.display())]
    Incompatible { path: PathBuf, reason: String },
    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("generation task aborted: {0}")]
    Aborted(String),
}
