//! Logging infrastructure.
//!
//! Structured logging via `tracing`, configurable through the `RUST_LOG`
//! environment variable. Two initializers:
//!
//! - [`init_console`] for interactive use — compact output on stderr, so
//!   the out-of-process worker binding keeps stdout free for protocol
//!   frames.
//! - [`init_with_file`] adds a non-blocking file layer for long sessions.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping it flushes and closes the file writer, when one is active.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initializes console-only logging on stderr.
///
/// Defaults to `info` when `RUST_LOG` is not set. stdout is deliberately
/// left untouched: the IPC worker binding owns it.
pub fn init_console() -> LoggingGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_timer(LocalTime::rfc_3339())
                .with_ansi(true),
        )
        .init();

    LoggingGuard { _file_guard: None }
}

/// Initializes logging to stderr plus a non-blocking log file.
///
/// The previous log file is cleared on session start.
///
/// # Errors
///
/// Returns an error when the log directory cannot be created or the log
/// file cannot be cleared.
pub fn init_with_file(log_dir: &Path, log_file: &str) -> Result<LoggingGuard, io::Error> {
    std::fs::create_dir_all(log_dir)?;
    std::fs::write(log_dir.join(log_file), "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: Some(file_guard),
    })
}
