//! Structured logging setup.
//!
//! Console output always; a daily rolling file as well when a log directory
//! is configured. `RUST_LOG` overrides the configured filter.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

pub const LOG_FILE_PREFIX: &str = "settlement";

/// Install the global subscriber. The returned guard flushes the file writer
/// when dropped, so callers keep it alive for the life of the process.
/// Returns `None` when only console logging is active or a subscriber was
/// already installed.
pub fn init_logging(cfg: &LogConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.filter));
    let console_layer = fmt::layer().with_target(true);

    let Some(dir) = cfg.dir.as_ref() else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        return None;
    };

    prune_old_logs(dir, cfg.max_files);
    fs::create_dir_all(dir).ok();

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return None;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %dir.display(),
        "settlement engine logging initialised"
    );
    Some(guard)
}

/// Keep the newest `max_files` log files in `dir`. Returns how many were
/// deleted.
pub fn prune_old_logs(dir: &Path, max_files: usize) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry.path().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first; ties broken by name so daily files sort by date.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.into_iter().skip(max_files) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old log file"),
        }
    }
    removed
}
