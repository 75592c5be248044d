use std::{
    fmt,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{GenerationParams, ModelError};

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// A loaded model able to complete a prompt.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String>;

    /// Frees whatever the backend holds for this model. Called exactly once.
    fn release(&self) {}
}

/// Turns a weights file into a [`LanguageModel`].
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(
        &self,
        path: &Path,
        params: &GenerationParams,
    ) -> Result<Arc<dyn LanguageModel>, ModelError>;
}

/// Checks that `path` exists and starts with the GGUF header.
pub fn verify_weights(path: &Path) -> Result<(), ModelError> {
    if !path.is_file() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }
    let mut magic = [0u8; 4];
    let mut file = File::open(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if file.read_exact(&mut magic).is_err() || &magic != GGUF_MAGIC {
        return Err(ModelError::Incompatible {
            path: path.to_path_buf(),
            reason: "missing GGUF header".into(),
        });
    }
    Ok(())
}

/// One loaded model bound to its weights file and parameters.
///
/// The backend is released when the handle is dropped. A generation still
/// running in the background keeps its own reference to the model and is
/// discarded when it finishes.
pub struct ModelHandle {
    name: String,
    path: PathBuf,
    params: GenerationParams,
    model: Arc<dyn LanguageModel>,
    gate: Arc<Mutex<()>>,
    released: AtomicBool,
}

impl ModelHandle {
    pub async fn open(
        loader: &dyn ModelLoader,
        path: &Path,
        params: GenerationParams,
    ) -> Result<Self, ModelError> {
        verify_weights(path)?;
        let model = loader.load(path, &params).await?;
        let name = display_name(path);
        info!(model = %name, "model loaded");
        Ok(Self {
            name,
            path: path.to_path_buf(),
            params,
            model,
            gate: Arc::new(Mutex::new(())),
            released: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub(crate) fn model(&self) -> Arc<dyn LanguageModel> {
        Arc::clone(&self.model)
    }

    /// Serialises generations on this handle.
    pub(crate) fn gate(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.gate)
    }

    /// Releases the backend. Returns false if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.model.release();
        debug!(model = %self.name, "model released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("released", &self.is_released())
            .finish()
    }
}

pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct CountingModel {
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        async fn complete(&self, _: &str, _: &GenerationParams) -> anyhow::Result<String> {
            Ok("[]".into())
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingLoader {
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(
            &self,
            _: &Path,
            _: &GenerationParams,
        ) -> Result<Arc<dyn LanguageModel>, ModelError> {
            Ok(Arc::new(CountingModel {
                releases: Arc::clone(&self.releases),
            }))
        }
    }

    #[test]
    fn rejects_missing_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.gguf");
        assert!(matches!(verify_weights(&missing), Err(ModelError::NotFound(_))));

        let foreign = dir.path().join("model.gguf");
        std::fs::write(&foreign, b"PK\x03\x04zip").unwrap();
        assert!(matches!(
            verify_weights(&foreign),
            Err(ModelError::Incompatible { .. })
        ));

        let good = dir.path().join("good.gguf");
        std::fs::write(&good, b"GGUF\x03\x00\x00\x00").unwrap();
        assert!(verify_weights(&good).is_ok());
    }

    #[tokio::test]
    async fn handle_releases_backend_exactly_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.gguf");
        std::fs::write(&path, b"GGUF....").unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let loader = CountingLoader {
            releases: Arc::clone(&releases),
        };

        let handle = ModelHandle::open(&loader, &path, GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(handle.name(), "tiny.gguf");
        assert!(handle.release());
        assert!(!handle.release());
        drop(handle);

        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
