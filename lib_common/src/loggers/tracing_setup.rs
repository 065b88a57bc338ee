//! # Setup Logging
//!
//! Configures the `tracing` subscriber for a server process:
//! - The log level comes from `RUST_LOG`, falling back to the configured level.
//! - Console output is human-readable with targets and ANSI colors.
//! - A daily rotating file under the log directory receives JSON records.

use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber.
///
/// The returned `WorkerGuard` must be held until the process exits, otherwise
/// buffered file records are lost.
pub fn setup_logging(log_dir: &Path, log_level: &str, file_prefix: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    info!("Logging initialized with level: {}", log_level);
    Ok(guard)
}
