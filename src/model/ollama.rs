use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::models::ModelOptions;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::{debug, info};
use url::Url;

use super::{GenerationParams, LanguageModel, ModelError, ModelLoader};

const DEFAULT_HOST: &str = "http://127.0.0.1";
const DEFAULT_PORT: u16 = 11434;

/// Serves GGUF models through an Ollama server.
///
/// The weights file names the model: its stem is used as the Ollama tag
/// unless `aliases` maps the stem to another tag.
#[derive(Debug, Clone, Default)]
pub struct OllamaLoader {
    url: Option<Url>,
    api_key: Option<String>,
    aliases: BTreeMap<String, String>,
}

impl OllamaLoader {
    pub fn new(url: Option<Url>, api_key: Option<String>, aliases: BTreeMap<String, String>) -> Self {
        Self {
            url,
            api_key,
            aliases,
        }
    }

    pub fn model_tag(&self, path: &Path) -> String {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.aliases.get(&stem).cloned().unwrap_or(stem)
    }

    /// Host and port of the Ollama server. Without a configured URL the
    /// local default endpoint is used; a URL without a port takes its
    /// scheme's default.
    pub fn endpoint(&self) -> Result<(Url, u16), ModelError> {
        let Some(url) = self.url.clone() else {
            return Ok((Url::parse(DEFAULT_HOST).map_err(backend_err)?, DEFAULT_PORT));
        };
        if url.host_str().is_none() {
            return Err(ModelError::Backend(format!("ollama url {url} has no host")));
        }
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ModelError::Backend(format!("ollama url {url} has no port")))?;
        Ok((url, port))
    }

    fn build_client(&self) -> Result<Ollama, ModelError> {
        let (url, port) = self.endpoint()?;
        let Some(key) = &self.api_key else {
            return Ok(Ollama::new(url, port));
        };

        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| ModelError::Backend(format!("ollama api key: {e}")))?;
        headers.insert(AUTHORIZATION, value);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ModelError::Backend(format!("reqwest client: {e}")))?;
        Ok(Ollama::new_with_client(url, port, client))
    }
}

fn backend_err(err: url::ParseError) -> ModelError {
    ModelError::Backend(err.to_string())
}

#[async_trait]
impl ModelLoader for OllamaLoader {
    async fn load(
        &self,
        path: &Path,
        _params: &GenerationParams,
    ) -> Result<Arc<dyn LanguageModel>, ModelError> {
        let tag = self.model_tag(path);
        if tag.is_empty() {
            return Err(ModelError::Incompatible {
                path: path.to_path_buf(),
                reason: "cannot derive a model name".into(),
            });
        }
        let client = self.build_client()?;
        info!(model = %tag, "using ollama model");
        Ok(Arc::new(OllamaModel { client, tag }))
    }
}

struct OllamaModel {
    client: Ollama,
    tag: String,
}

fn model_options(params: &GenerationParams) -> ModelOptions {
    let mut options = ModelOptions::default()
        .num_ctx(params.n_ctx as u64)
        .num_predict(params.max_tokens as i32)
        .num_gpu(params.n_gpu_layers)
        .temperature(params.temperature)
        .top_k(params.top_k)
        .top_p(params.top_p)
        .repeat_penalty(params.repeat_penalty);
    if params.seed >= 0 {
        options = options.seed(params.seed as i32);
    }
    if !params.stop.is_empty() {
        options = options.stop(params.stop.clone());
    }
    options
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn complete(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let request = GenerationRequest::new(self.tag.clone(), prompt.to_string())
            .options(model_options(params));
        let response = self
            .client
            .generate(request)
            .await
            .map_err(|e| anyhow::anyhow!("ollama generate error: {e}"))?;
        Ok(response.response)
    }

    fn release(&self) {
        debug!(model = %self.tag, "dropping ollama client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GenerateOptions, ModelWorker, WorkerSettings};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn tag_comes_from_stem_or_alias() {
        let mut aliases = BTreeMap::new();
        aliases.insert("qwen2.5-7b-instruct-q4".to_string(), "qwen2.5:7b".to_string());
        let loader = OllamaLoader::new(None, None, aliases);

        assert_eq!(
            loader.model_tag(&PathBuf::from("models/qwen2.5-7b-instruct-q4.gguf")),
            "qwen2.5:7b"
        );
        assert_eq!(loader.model_tag(&PathBuf::from("models/llama3.gguf")), "llama3");
    }

    #[test]
    fn endpoint_keeps_portless_hosts() {
        let url = Url::parse("https://ollama.example.com/").unwrap();
        let loader = OllamaLoader::new(Some(url), Some("secret".into()), BTreeMap::new());

        let (url, port) = loader.endpoint().unwrap();
        assert_eq!(url.host_str(), Some("ollama.example.com"));
        assert_eq!(port, 443);
        assert!(loader.build_client().is_ok());

        let explicit = OllamaLoader::new(
            Some(Url::parse("http://10.0.0.5:8080").unwrap()),
            None,
            BTreeMap::new(),
        );
        assert_eq!(explicit.endpoint().unwrap().1, 8080);
    }

    #[test]
    fn endpoint_defaults_to_the_local_server() {
        let loader = OllamaLoader::new(None, Some("secret".into()), BTreeMap::new());
        let (url, port) = loader.endpoint().unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(port, 11434);
        assert!(loader.build_client().is_ok());
    }

    #[test]
    fn hostless_url_is_rejected() {
        let loader = OllamaLoader::new(
            Some(Url::parse("data:text/plain,hi").unwrap()),
            None,
            BTreeMap::new(),
        );
        assert!(matches!(loader.endpoint(), Err(ModelError::Backend(_))));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_generation_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llama3.gguf");
        std::fs::write(&path, b"GGUF").unwrap();
        let loader = OllamaLoader::new(Some(Url::parse("http://127.0.0.1:1/").unwrap()), None, BTreeMap::new());

        let worker = ModelWorker::load(&loader, &path, GenerationParams::default(), WorkerSettings::default())
            .await
            .unwrap();
        let result = worker.generate("hello", &GenerateOptions::default()).await;

        assert!(result.is_err());
    }
}
