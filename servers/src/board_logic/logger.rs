use anyhow::{Result, anyhow};
use std::cmp::Reverse;
use std::fs;
use std::path::Path;
use std::time::SystemTime;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_PREFIX: &str = "server_board.log";

/// Console plus a daily JSON file under `log_dir`. `RUST_LOG` wins over
/// `log_level`. The returned guard must live as long as the process logs.
pub fn setup_logging(log_dir: &Path, log_level: &str, retention: usize) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep room for the file the appender is about to open
    let removed = cleanup_old_logs(log_dir, retention.saturating_sub(1))?;

    let file_appender = rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow!("invalid log level '{}': {}", log_level, e))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))?;

    info!(
        "Logging initialized with level: {} ({} old log files removed)",
        log_level, removed
    );
    Ok(guard)
}

/// Deletes all but the `keep` most recent log files in `log_dir`.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<usize> {
    let mut entries: Vec<(Option<SystemTime>, std::path::PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok();
            (modified, e.path())
        })
        .collect();

    // Newest first
    entries.sort_by_key(|(modified, _)| Reverse(*modified));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}
