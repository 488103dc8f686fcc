use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Routes `tracing` output to `<config>/logs/studybuddy.log`.
///
/// The previous run's log is kept as `studybuddy.log.old`. The returned guard
/// flushes the writer when dropped, so `main` must hold it.
pub fn init(config_dir: &Path) -> Option<WorkerGuard> {
    let log_dir = config_dir.join("logs");
    fs::create_dir_all(&log_dir).ok();

    let log_path = log_dir.join("studybuddy.log");
    if log_path.exists() {
        let old_path = log_dir.join("studybuddy.log.old");
        if old_path.exists() {
            let _ = fs::remove_file(&old_path);
        }
        let _ = fs::rename(&log_path, old_path);
    }

    let appender = tracing_appender::rolling::never(&log_dir, "studybuddy.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();

    match installed {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}
