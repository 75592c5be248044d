use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::warn;

/// Finds model files in a directory and applies the configured name filters.
#[derive(Debug, Clone)]
pub struct ModelScanner {
    dir: PathBuf,
    extension: String,
}

impl ModelScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: "gguf".into(),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    /// Model files directly inside the directory, sorted by file name. A
    /// missing directory yields nothing.
    pub fn scan(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "cannot scan models directory");
                return Vec::new();
            }
        };
        let mut models: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && has_extension(p, &self.extension))
            .collect();
        models.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
        models
    }

    /// Drops names containing any blacklist pattern, then keeps only names
    /// containing a whitelist pattern when the whitelist is not empty.
    pub fn filter(models: Vec<PathBuf>, whitelist: &[String], blacklist: &[String]) -> Vec<PathBuf> {
        models
            .into_iter()
            .filter(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if blacklist.iter().any(|p| name.contains(p.as_str())) {
                    return false;
                }
                whitelist.is_empty() || whitelist.iter().any(|p| name.contains(p.as_str()))
            })
            .collect()
    }

    pub fn scan_filtered(&self, whitelist: &[String], blacklist: &[String]) -> Vec<PathBuf> {
        Self::filter(self.scan(), whitelist, blacklist)
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == extension)
}
