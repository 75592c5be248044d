use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `autopilot=debug`.
    pub level: String,
    /// Rolling text log, relative to the root.
    pub log_file: PathBuf,
    /// Rolling JSON log of `request` events, relative to the root.
    pub event_file: PathBuf,
    /// Also write human-readable lines to stderr.
    pub console: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_file: PathBuf::from("logs/autopilot.log"),
            event_file: PathBuf::from("logs/requests.json"),
            console: false,
        }
    }
}

fn appender(root: &Path, file: &Path) -> Result<RollingFileAppender> {
    let path = root.join(file);
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    let name = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create log directory {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, name))
}

/// Installs the global subscriber: a daily text log, a daily JSON log that
/// only receives `target: "request"` events, and optionally stderr.
pub fn init_tracing(root: &Path, settings: &LogSettings) -> Result<()> {
    let env_filter = EnvFilter::try_new(&settings.level)
        .with_context(|| format!("invalid log level `{}`", settings.level))?;

    let txt_layer = fmt::layer()
        .with_writer(appender(root, &settings.log_file)?)
        .with_ansi(false);

    let json_layer = fmt::layer()
        .json()
        .with_writer(appender(root, &settings.event_file)?)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
    });

    Registry::default()
        .with(env_filter)
        .with(txt_layer)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(())
}

/// Awaits `request`, logs its outcome and emits one JSON `request` line with
/// its name, latency and status.
pub async fn instrument_request<Fut, T, E>(name: &str, request: Fut) -> Result<T, E>
where
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let result = request.await;
    let elapsed = start.elapsed().as_secs_f64() * 1_000.0;

    match &result {
        Ok(_) => info!("request `{}` succeeded in {:.1} ms", name, elapsed),
        Err(err) => error!(error = %err, "request `{}` failed in {:.1} ms", name, elapsed),
    }
    tracing::event!(
        target: "request",
        tracing::Level::INFO,
        request = name,
        latency_ms = elapsed,
        status = if result.is_ok() { "ok" } else { "error" },
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appender_creates_the_log_directory() {
        let dir = TempDir::new().unwrap();
        appender(dir.path(), Path::new("logs/nested/app.log")).unwrap();
        assert!(dir.path().join("logs/nested").is_dir());
    }

    #[test]
    fn rejects_a_path_without_file_name() {
        let dir = TempDir::new().unwrap();
        assert!(appender(dir.path(), Path::new("..")).is_err());
    }

    #[tokio::test]
    async fn instrument_request_passes_the_result_through() {
        let ok: Result<u8, String> = instrument_request("ok", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
        let failed: Result<u8, String> =
            instrument_request("failed", async { Err("boom".to_string()) }).await;
        assert_eq!(failed, Err("boom".to_string()));
    }
}
