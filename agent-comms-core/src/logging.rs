//! Tracing subscriber setup

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::schema::LoggingConfig;

const LOG_FILE_PREFIX: &str = "agent-comms.log";
const LOG_RETENTION_DAYS: u64 = 7;

/// Initialize the logging system
///
/// `RUST_LOG` wins over the configured level and `LOG_FORMAT` over the
/// configured format. The returned guard must outlive all logging, or
/// buffered file output is lost.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    for (module, level) in &config.overrides {
        match format!("{}={}", module, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(_) => eprintln!("Invalid log directive: {}={}", module, level),
        }
    }

    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.format.clone());
    let is_json = format.eq_ignore_ascii_case("json");

    // Produces agent-comms.log.YYYY-MM-DD
    let file_appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Console output goes to stderr; stdout is reserved for command output
    let console_layer = if is_json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let file_layer = if is_json {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Err(e) = cleanup_old_logs(
        Path::new(&config.dir),
        Duration::from_secs(LOG_RETENTION_DAYS * 24 * 3600),
    ) {
        eprintln!("Failed to clean up old logs: {}", e);
    }

    guard
}

/// Remove rolled log files older than `max_age`
fn cleanup_old_logs(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());

        if age.is_some_and(|age| age > max_age) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cleanup_missing_dir_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert_eq!(cleanup_old_logs(&missing, Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_only_touches_log_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("agent-comms.log.2020-01-01"), "old").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "keep").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let removed = cleanup_old_logs(temp_dir.path(), Duration::from_millis(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(temp_dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_keeps_recent_logs() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("agent-comms.log.2099-01-01"), "new").unwrap();

        let removed = cleanup_old_logs(temp_dir.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 0);
    }
}
