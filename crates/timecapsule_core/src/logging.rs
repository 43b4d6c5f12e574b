//! Process-wide log sink for the engine and its workers.
//!
//! # Responsibility
//! - Start one rolling file logger per process from [`LoggingConfig`].
//! - Capture panics as sanitized `event=panic_captured` lines.
//!
//! # Invariants
//! - Engine events are metadata-only: identifiers, statuses and counters.
//!   Letter content, recipient emails and mailing addresses never reach a log
//!   line.
//! - A second init with identical settings is a no-op; different settings are
//!   rejected and the running sink is kept.
//! - Nothing in this module panics.

use crate::config::LoggingConfig;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LOG_BASENAME: &str = "timecapsule";
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_ROTATED: usize = 5;
const PANIC_SUMMARY_CHARS: usize = 160;

static ACTIVE_SINK: OnceCell<ActiveSink> = OnceCell::new();
static PANIC_HOOK: OnceCell<()> = OnceCell::new();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoggingError {
    #[error("unsupported log level `{0}`; expected trace|debug|info|warn|error")]
    UnsupportedLevel(String),
    #[error("log directory must be a non-empty absolute path, got `{0}`")]
    InvalidDirectory(String),
    #[error("logging already runs with {active}; refusing {requested}")]
    AlreadyInitialized { active: String, requested: String },
    #[error("log sink failed to start: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SinkSettings {
    level: &'static str,
    dir: PathBuf,
}

impl SinkSettings {
    fn parse(level: &str, log_dir: &str) -> Result<Self, LoggingError> {
        let level = match level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" | "warning" => "warn",
            "error" => "error",
            other => return Err(LoggingError::UnsupportedLevel(other.to_string())),
        };

        let trimmed = log_dir.trim();
        let dir = Path::new(trimmed);
        if trimmed.is_empty() || !dir.is_absolute() {
            return Err(LoggingError::InvalidDirectory(trimmed.to_string()));
        }

        Ok(Self {
            level,
            dir: dir.to_path_buf(),
        })
    }

    fn describe(&self) -> String {
        format!("level={} dir={}", self.level, self.dir.display())
    }
}

struct ActiveSink {
    settings: SinkSettings,
    _handle: LoggerHandle,
}

/// Starts the rolling file logger at `log_dir` with `level`.
///
/// # Errors
/// - `UnsupportedLevel` / `InvalidDirectory` for bad arguments.
/// - `AlreadyInitialized` when a sink with other settings is running.
/// - `Backend` when the directory cannot be created or flexi_logger fails.
pub fn init_logging(level: &str, log_dir: &str) -> Result<(), LoggingError> {
    let requested = SinkSettings::parse(level, log_dir)?;
    let sink = ACTIVE_SINK.get_or_try_init(|| start_sink(requested.clone()))?;

    if sink.settings != requested {
        return Err(LoggingError::AlreadyInitialized {
            active: sink.settings.describe(),
            requested: requested.describe(),
        });
    }
    Ok(())
}

/// Starts logging from engine configuration.
///
/// Returns `Ok(false)` when no `log_dir` is configured.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<bool, LoggingError> {
    match config.log_dir.as_deref() {
        Some(dir) => init_logging(&config.level, dir).map(|()| true),
        None => Ok(false),
    }
}

/// `(level, log_dir)` of the running sink, if any.
pub fn logging_status() -> Option<(&'static str, PathBuf)> {
    ACTIVE_SINK
        .get()
        .map(|sink| (sink.settings.level, sink.settings.dir.clone()))
}

pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start_sink(settings: SinkSettings) -> Result<ActiveSink, LoggingError> {
    std::fs::create_dir_all(&settings.dir).map_err(|err| {
        LoggingError::Backend(format!("create `{}`: {err}", settings.dir.display()))
    })?;

    let handle = Logger::try_with_str(settings.level)
        .map_err(|err| LoggingError::Backend(err.to_string()))?
        .log_to_file(
            FileSpec::default()
                .directory(settings.dir.as_path())
                .basename(LOG_BASENAME),
        )
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEEP_ROTATED),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(|err| LoggingError::Backend(err.to_string()))?;

    install_panic_hook();
    info!(
        "event=engine_start module=logging status=ok os={} version={} level={}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION"),
        settings.level
    );

    Ok(ActiveSink {
        settings,
        _handle: handle,
    })
}

fn install_panic_hook() {
    if PANIC_HOOK.set(()).is_err() {
        return;
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map_or_else(|| "unknown".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string payload".to_string());
        // Panic messages can echo letter fields.
        error!(
            "event=panic_captured module=logging status=error location={} payload={}",
            location,
            one_line_summary(&payload, PANIC_SUMMARY_CHARS)
        );
        previous(info);
    }));
}

fn one_line_summary(value: &str, max_chars: usize) -> String {
    let flat = value.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut summary: String = flat.chars().take(max_chars).collect();
    summary.push_str("...");
    summary
}
