// Logging setup
//
// Console output always; with a log directory, also daily rolling JSON files
// written through a non-blocking appender.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "proxima";

/// Install the global subscriber. RUST_LOG wins over `default_level`.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init(default_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Logging already initialized")?;

    Ok(guard)
}

/// Log directory: the configured one, else `logs/` under the data directory
pub fn log_directory(configured: Option<&str>, data_dir: &Path) -> PathBuf {
    configured
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"))
}
