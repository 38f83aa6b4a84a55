use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use tokio::sync::RwLock;
use tracing::Level;
use tracing::{debug, info, metadata::LevelFilter, trace};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{prelude::*, EnvFilter};

// Lines written to the file are buffered until this is dropped.
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// Job logs are separate, see [`crate::shared::SharedState::log`].
/// This is the process log: stdout, plus a daily file when asked for.
fn do_init(stdout_level: Level, file_level: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with:");

    // stdout
    message += " stdout";

    // `RUST_LOG` may narrow things down further, e.g. `RUST_LOG=meter_eol::listener=trace`.
    let stdout_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(stdout_level).into())
        .from_env_lossy();
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(stdout_filter);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let maybe_file_layer = if let Some((level, output_dir)) = file_level {
        message += &format!(", file (in dir {output_dir:?})");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, "eol.log");
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        *FILE_GUARD.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    // Another subscriber may already be set, e.g. by a test harness.
    if let Err(e) = registry.with(maybe_file_layer).try_init() {
        eprintln!("Could not set up logging: {e}");
        return;
    }

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Flush anything still buffered for the log file.
///
/// Lines logged afterwards no longer reach the file.
pub fn shutdown() {
    trace!("Shutting down");

    let guard = FILE_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_is_written_by_shutdown() {
        let dir = std::env::temp_dir().join(format!("meter-eol-log-{}", uuid::Uuid::new_v4()));

        init(Level::INFO, Some((Level::INFO, dir.clone()))).await;
        tracing::info!("written before shutdown");
        shutdown();

        let text = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect::<String>();
        assert!(text.contains("written before shutdown"));

        // Nothing left to flush.
        shutdown();

        std::fs::remove_dir_all(dir).unwrap();
    }
}
