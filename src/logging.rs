//! Tracing setup for hosts that embed the engine.
//!
//! The engine itself only emits `tracing` events; installing subscribers is
//! the host's call. This module offers the default wiring: a daily-rolling
//! JSON file under the engine home (next to `config.json` and the upload
//! sessions) and, optionally, a compact console layer. Level filtering can
//! be pinned programmatically or left to `RUST_LOG`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::CONFIG_DIR;

pub struct LogConfig {
    /// Where the rolling files land. Defaults to `<engine home>/logs`.
    pub log_dir: PathBuf,
    /// Rolling file name prefix.
    pub file_prefix: String,
    /// Daily files kept before rotation deletes the oldest.
    pub max_files: usize,
    /// Mirror events to stdout. Hosts that render their own UI keep this
    /// off and read the JSON files instead.
    pub console: bool,
    /// Fixed level filter. `None` defers to `RUST_LOG`, falling back to
    /// `info`. Targets follow the module areas: `protocol::*`,
    /// `connection`/`connection::*`, `transfer::*`, `tasks::scheduler`,
    /// `retry`, `ftp`/`ftp::*`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join("logs");
        LogConfig {
            log_dir,
            file_prefix: "efm-engine".to_string(),
            max_files: 5,
            console: true,
            filter: None,
        }
    }
}

impl LogConfig {
    fn env_filter(&self) -> EnvFilter {
        match &self.filter {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }
}

/// Keeps the background log writer alive; drop it last. Dropping flushes
/// whatever the non-blocking writer still buffers.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Install the global subscriber per `config`.
///
/// Fails if a subscriber is already installed (a host that brings its own
/// tracing setup should simply not call this).
pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.log_dir)
        .context("Failed to create rolling file appender")?;
    let (file_writer, worker) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(config.env_filter());

    let console_layer = config.console.then(|| {
        fmt::layer()
            .compact()
            .with_target(true)
            .with_line_number(true)
            .with_filter(config.env_filter())
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(
        target: "main",
        log_dir = %config.log_dir.display(),
        max_files = config.max_files,
        "Logging initialized"
    );
    Ok(LogGuard { _worker: worker })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_lives_under_the_engine_home() {
        let config = LogConfig::default();
        assert!(config.log_dir.ends_with(format!("{CONFIG_DIR}/logs")));
        assert_eq!(config.file_prefix, "efm-engine");
        assert_eq!(config.max_files, 5);
        assert!(config.console);
    }

    #[test]
    fn explicit_filter_overrides_the_environment() {
        let config = LogConfig {
            filter: Some("transfer::engine=trace,connection=warn".to_owned()),
            ..LogConfig::default()
        };
        // Directives that fail to parse would panic inside EnvFilter::new;
        // building proves the programmatic path is taken as-is.
        let _ = config.env_filter();
    }

    // Only one test in the whole binary may install the global subscriber.
    #[test]
    fn init_logging_writes_events_to_the_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let guard = init_logging(LogConfig {
            log_dir: log_dir.clone(),
            file_prefix: "engine-test".to_owned(),
            max_files: 2,
            console: false,
            filter: Some("trace".to_owned()),
        })
        .unwrap();

        tracing::info!(target: "transfer::engine", marker = "log-smoke", "Test event");
        // Dropping the guard blocks until the worker has flushed.
        drop(guard);

        let mut contents = String::new();
        for entry in std::fs::read_dir(&log_dir).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("engine-test"), "unexpected file {name}");
            contents.push_str(&std::fs::read_to_string(&path).unwrap());
        }
        assert!(contents.contains("log-smoke"));

        // A second install is refused rather than silently ignored.
        assert!(init_logging(LogConfig {
            log_dir,
            file_prefix: "engine-test".to_owned(),
            max_files: 2,
            console: false,
            filter: Some("trace".to_owned()),
        })
        .is_err());
    }
}
