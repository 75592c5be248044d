use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::model::{GenerationParams, WorkerSettings};
use crate::orchestrator::{OrchestrationMode, OrchestratorSettings};
use crate::plan::ExecutorSettings;

pub const ENV_PREFIX: &str = "AUTOPILOT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid YAML in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
    #[error("unsupported config format `{0}`")]
    Format(String),
    #[error("bad value for {key}: {reason}")]
    Value { key: String, reason: String },
}

/// Where string overrides come from.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment, seeded from a `.env` file when one exists.
#[derive(Debug, Clone)]
pub struct EnvSource {
    env_file: PathBuf,
}

impl EnvSource {
    pub fn new(env_file: impl Into<PathBuf>) -> Self {
        let env_file = env_file.into();
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded .env from {}", env_file.display()),
                Err(err) => warn!(error = %err, "could not parse {}", env_file.display()),
            }
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }
}

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// In-memory overrides, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MapSource {
    map: DashMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

fn default_plugins() -> Vec<String> {
    ["console", "system", "plugin_manager", "debug", "task_planner"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Application settings. Every field has a default, so an empty file (or no
/// file) is a valid configuration. Unknown top-level keys are kept as plugin
/// sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub plugins: Vec<String>,
    pub required_plugins: Vec<String>,
    /// Directory of `<name>.plugin` marker files watched for hot add/remove.
    pub plugin_dir: Option<PathBuf>,
    pub bus_workers: usize,

    pub models_dir: PathBuf,
    pub model_whitelist: Vec<String>,
    pub model_blacklist: Vec<String>,
    pub ollama_url: Option<Url>,
    #[serde(skip_serializing)]
    pub ollama_api_key: Option<String>,
    /// Model file stem to Ollama tag.
    pub ollama_models: BTreeMap<String, String>,
    pub generation: GenerationParams,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    pub orchestration_mode: OrchestrationMode,
    pub cross_iterations: usize,
    pub preview_chars: usize,
    pub step_delay_ms: u64,

    pub data_dir: PathBuf,
    pub log_level: String,

    #[serde(flatten)]
    pub sections: BTreeMap<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plugins: default_plugins(),
            required_plugins: vec!["console".into(), "system".into()],
            plugin_dir: None,
            bus_workers: 4,
            models_dir: PathBuf::from("models"),
            model_whitelist: Vec::new(),
            model_blacklist: Vec::new(),
            ollama_url: None,
            ollama_api_key: None,
            ollama_models: BTreeMap::new(),
            generation: GenerationParams::default(),
            timeout_secs: 300,
            max_retries: 3,
            retry_delay_ms: 2000,
            orchestration_mode: OrchestrationMode::Single,
            cross_iterations: 2,
            preview_chars: 500,
            step_delay_ms: 100,
            data_dir: PathBuf::from("data"),
            log_level: "info".into(),
            sections: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Reads a `.json`, `.yaml` or `.yml` file. A missing file yields the
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            }),
            "yaml" | "yml" => serde_yaml_bw::from_str(&text).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            }),
            other => Err(ConfigError::Format(other.to_string())),
        }
    }

    /// Looks for `config.yaml`, `config.yml` then `config.json` under `root`.
    pub fn discover(root: &Path) -> Result<Self, ConfigError> {
        ["config.yaml", "config.yml", "config.json"]
            .iter()
            .map(|name| root.join(name))
            .find(|path| path.exists())
            .map_or_else(|| Ok(Self::default()), |path| Self::load(&path))
    }

    /// Applies `AUTOPILOT_*` overrides.
    pub fn apply_overrides(&mut self, source: &dyn ConfigSource) -> Result<(), ConfigError> {
        let var = |name: &str| source.get(&format!("{ENV_PREFIX}{name}"));

        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(mode) = var("MODE") {
            self.orchestration_mode = mode.parse().map_err(|_| ConfigError::Value {
                key: format!("{ENV_PREFIX}MODE"),
                reason: format!("`{mode}` is not one of single, multi, cross"),
            })?;
        }
        if let Some(dir) = var("MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("PLUGIN_DIR") {
            self.plugin_dir = Some(PathBuf::from(dir));
        }
        if let Some(list) = var("PLUGINS") {
            self.plugins = split_list(&list);
        }
        if let Some(url) = var("OLLAMA_URL") {
            self.ollama_url = Some(Url::parse(&url).map_err(|e| ConfigError::Value {
                key: format!("{ENV_PREFIX}OLLAMA_URL"),
                reason: e.to_string(),
            })?);
        }
        if let Some(key) = var("OLLAMA_API_KEY") {
            self.ollama_api_key = Some(key);
        }
        if let Some(secs) = var("TIMEOUT_SECS") {
            self.timeout_secs = secs.trim().parse().map_err(|_| ConfigError::Value {
                key: format!("{ENV_PREFIX}TIMEOUT_SECS"),
                reason: format!("`{secs}` is not a number of seconds"),
            })?;
        }
        Ok(())
    }

    /// Makes relative directories relative to `root`.
    pub fn resolve_paths(&mut self, root: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };
        anchor(&mut self.models_dir);
        anchor(&mut self.data_dir);
        if let Some(dir) = self.plugin_dir.as_mut() {
            anchor(dir);
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            params: self.generation.clone(),
            worker: self.worker_settings(),
            cross_rounds: self.cross_iterations.max(1),
            preview_chars: self.preview_chars,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            step_delay: Duration::from_millis(self.step_delay_ms),
        }
    }

    /// The whole configuration as one JSON object, plugin sections at the
    /// top level.
    pub fn to_plugin_config(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| {
            warn!(error = %err, "could not serialise configuration for plugins");
            Value::Object(Default::default())
        })
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.generation.n_ctx, 8192);
        assert_eq!(config.worker_settings().timeout, Duration::from_secs(300));
    }

    #[test]
    fn yaml_keeps_unknown_sections_for_plugins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "orchestration_mode: cross\ncross_iterations: 3\ngeneration:\n  temperature: 0.2\ndebug:\n  debug_mode: false\n",
        )
        .unwrap();

        let config = AppConfig::discover(dir.path()).unwrap();

        assert_eq!(config.orchestration_mode, OrchestrationMode::Cross);
        assert_eq!(config.orchestrator_settings().cross_rounds, 3);
        assert_eq!(config.generation.temperature, 0.2);
        assert_eq!(config.generation.top_k, 40);
        let plugin_view = config.to_plugin_config();
        assert_eq!(plugin_view["debug"], json!({"debug_mode": false}));
        assert_eq!(plugin_view["cross_iterations"], json!(3));
    }

    #[test]
    fn json_and_unknown_formats() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, r#"{"plugins": ["console"], "step_delay_ms": 0}"#).unwrap();
        let config = AppConfig::load(&json_path).unwrap();
        assert_eq!(config.plugins, vec!["console"]);
        assert_eq!(config.executor_settings().step_delay, Duration::ZERO);

        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, "").unwrap();
        assert!(matches!(AppConfig::load(&toml_path), Err(ConfigError::Format(f)) if f == "toml"));
    }

    #[test]
    fn overrides_come_from_the_source() {
        let source = MapSource::new();
        source.set("AUTOPILOT_MODE", "MULTI");
        source.set("AUTOPILOT_PLUGINS", "console, system ,,debug");
        source.set("AUTOPILOT_OLLAMA_URL", "http://localhost:11434/");
        let mut config = AppConfig::default();

        config.apply_overrides(&source).unwrap();

        assert_eq!(config.orchestration_mode, OrchestrationMode::Multi);
        assert_eq!(config.plugins, vec!["console", "system", "debug"]);
        assert_eq!(config.ollama_url.unwrap().port(), Some(11434));

        source.set("AUTOPILOT_TIMEOUT_SECS", "soon");
        let err = AppConfig::default().apply_overrides(&source).unwrap_err();
        assert!(err.to_string().contains("AUTOPILOT_TIMEOUT_SECS"));
    }

    #[test]
    fn relative_dirs_hang_off_the_root() {
        let mut config = AppConfig {
            plugin_dir: Some(PathBuf::from("plugins")),
            data_dir: PathBuf::from("/var/lib/autopilot"),
            ..Default::default()
        };
        config.resolve_paths(Path::new("/opt/autopilot"));
        assert_eq!(config.models_dir, PathBuf::from("/opt/autopilot/models"));
        assert_eq!(config.plugin_dir, Some(PathBuf::from("/opt/autopilot/plugins")));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/autopilot"));
    }

    #[test]
    fn env_source_reads_the_dotenv_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "AUTOPILOT_TEST_DOTENV_KEY=from-file\n").unwrap();

        let source = EnvSource::new(&path);

        assert_eq!(source.get("AUTOPILOT_TEST_DOTENV_KEY").as_deref(), Some("from-file"));
        assert!(source.get("AUTOPILOT_TEST_NEVER_SET").is_none());
    }
}
