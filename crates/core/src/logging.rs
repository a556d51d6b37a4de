//! Subscriber setup for hosts embedding the interpolator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime logs every graph optimisation pass at info level.
pub const ORT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_RETENTION: usize = 14;
const LOG_FILE_PREFIX: &str = "drba";
const LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    /// `EnvFilter` directive. `None` logs at `info` with ONNX Runtime quietened.
    pub filter: Option<String>,
    /// Daily rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    /// Rolled files kept on disk; 0 means the default.
    pub retention: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            filter: None,
            log_dir: None,
            retention: DEFAULT_RETENTION,
        }
    }
}

impl LoggingOptions {
    /// Defaults with the filter taken from `RUST_LOG`.
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("RUST_LOG")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            ..Self::default()
        }
    }

    pub fn directive(&self) -> String {
        match self.filter.as_deref() {
            Some(filter) => filter.to_string(),
            None => format!("{ORT_NOISE_FILTER},{DEFAULT_LOG_FILTER}"),
        }
    }

    fn retention(&self) -> usize {
        if self.retention == 0 {
            DEFAULT_RETENTION
        } else {
            self.retention
        }
    }
}

/// Parse `directive`, falling back to [`DEFAULT_LOG_FILTER`] when it is malformed.
pub fn env_filter(directive: &str) -> EnvFilter {
    match EnvFilter::try_new(directive) {
        Ok(filter) => filter,
        Err(error) => {
            eprintln!("Ignoring log filter '{directive}' ({error}), using '{DEFAULT_LOG_FILTER}'");
            EnvFilter::new(DEFAULT_LOG_FILTER)
        }
    }
}

/// Create `dir` if needed and open a daily appender in it.
pub fn rolling_appender(dir: &Path, retention: usize) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(dir)
        .with_context(|| format!("failed to open log files in {}", dir.display()))
}

/// Install the global subscriber: stderr always, plus the rolling file when
/// `log_dir` is usable. Returns the directory being written to.
pub fn init_logging(options: &LoggingOptions) -> Option<PathBuf> {
    let directive = options.directive();
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(&directive));

    let file = options
        .log_dir
        .as_deref()
        .map(|dir| rolling_appender(dir, options.retention()).map(|appender| (dir, appender)));
    let (file_layer, active_dir, file_error) = match file {
        Some(Ok((dir, appender))) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(env_filter(&directive));
            (Some(layer), Some(dir.to_path_buf()), None)
        }
        Some(Err(error)) => (None, None, Some(error)),
        None => (None, None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Tracing subscriber already installed: {error}");
        return None;
    }
    if let Some(error) = file_error {
        warn!(error = %format!("{error:#}"), "File logging disabled, logging to stderr only");
    }
    active_dir
}
