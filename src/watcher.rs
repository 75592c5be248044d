use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher, event::ModifyKind,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, info, warn};

use crate::registry::PluginRegistry;

pub const PLUGIN_MARKER_EXT: &str = "plugin";

/// Something that reacts to files appearing in and disappearing from a
/// directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// The background tasks watching one directory. Dropping it without calling
/// [`shutdown`](Self::shutdown) leaves them running.
pub struct DirectoryWatcher {
    dir: PathBuf,
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Starts polling `dir` for files that `watched` finds relevant or whose
    /// extension is in `exts`. With `initial_scan` the files already present
    /// are reloaded first; with `enable_retry` failed reloads are retried a
    /// few times.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            let mut present: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .collect();
            present.sort();
            for path in present {
                if watched.is_relevant(&path) || is_valid_extension(&path, exts) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody is listening once the dispatch task is gone
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let handle_watcher = tokio::spawn(async move {
            // keeps the poll watcher alive until aborted
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(?e, "Watcher error");
                        continue;
                    }
                };
                let relevant = event
                    .paths
                    .into_iter()
                    .filter(|p| watched.is_relevant(p) || has_extension(p, &exts));
                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) => {
                        for path in relevant {
                            if let Err(e) = watched.on_create_or_modify(&path).await {
                                warn!(?path, ?e, "Failed to handle create/modify");
                            }
                        }
                    }
                    EventKind::Remove(_) => {
                        for path in relevant {
                            if let Err(e) = watched.on_remove(&path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    _ => {}
                }
            }
        });

        info!(dir = %dir.display(), "watching directory");
        Ok(DirectoryWatcher {
            dir,
            handles: vec![handle_dispatch, handle_watcher],
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Aborts the watcher tasks; no further events are dispatched.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn is_valid_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|&e| e == ext))
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e == ext))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Hot add and remove through marker files: creating `<dir>/<name>.plugin`
/// loads plugin `name`, deleting it removes the plugin again.
pub struct PluginDirWatch {
    registry: Weak<PluginRegistry>,
}

impl PluginDirWatch {
    pub fn new(registry: &Arc<PluginRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }

    fn registry(&self) -> Result<Arc<PluginRegistry>> {
        match self.registry.upgrade() {
            Some(registry) => Ok(registry),
            None => bail!("plugin registry is gone"),
        }
    }
}

fn plugin_name(path: &Path) -> Result<String> {
    match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
        _ => bail!("cannot derive a plugin name from {}", path.display()),
    }
}

#[async_trait]
impl WatchedType for PluginDirWatch {
    fn is_relevant(&self, path: &Path) -> bool {
        is_valid_extension(path, &[PLUGIN_MARKER_EXT])
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let name = plugin_name(path)?;
        let registry = self.registry()?;
        if registry.contains(&name) {
            return Ok(());
        }
        registry.load(&name)?;
        info!(plugin = %name, "plugin added from marker file");
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        let name = plugin_name(path)?;
        let registry = self.registry()?;
        if !registry.contains(&name) {
            return Ok(());
        }
        registry.remove(&name)?;
        info!(plugin = %name, "plugin removed with its marker file");
        Ok(())
    }
}
