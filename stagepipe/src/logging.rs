//! Tracing setup for binaries and tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the application through [`init_logging`].

use std::path::PathBuf;

use stagepipe_shared::errors::{PipelineError, PipelineResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Environment variable holding a full `EnvFilter` expression. Takes
/// precedence over [`LoggingOptions::level`].
pub const LOG_ENV: &str = "STAGEPIPE_LOG";

const LOG_FILE_PREFIX: &str = "stagepipe.log";

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Filter used when `STAGEPIPE_LOG` is unset, e.g. `info` or
    /// `stagepipe=debug,warn`.
    pub level: String,

    /// Also write to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,

    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            ansi: true,
        }
    }
}

/// Keeps the background file writer alive. Drop it last.
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A second call leaves the first subscriber in place and returns an empty
/// guard.
pub fn init_logging(options: &LoggingOptions) -> PipelineResult<LoggingGuard> {
    let filter = build_filter(options)?;

    let (file_layer, file_guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                PipelineError::Config(format!(
                    "failed to create log directory {}: {e}",
                    dir.display()
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(options.ansi)
        .with_thread_names(true);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => Ok(LoggingGuard { _file: file_guard }),
        Err(e) => {
            tracing::debug!(error = %e, "Global subscriber already installed");
            Ok(LoggingGuard { _file: None })
        }
    }
}

fn build_filter(options: &LoggingOptions) -> PipelineResult<EnvFilter> {
    let directives = match std::env::var(LOG_ENV) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => options.level.clone(),
    };
    EnvFilter::try_new(&directives)
        .map_err(|e| PipelineError::Config(format!("invalid log filter '{directives}': {e}")))
}
