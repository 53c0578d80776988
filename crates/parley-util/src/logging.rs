use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" | "TRACE" => LogLevel::Debug,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines.
pub struct LogGuard {
    pub path: Option<PathBuf>,
    _worker: Option<WorkerGuard>,
}

pub fn log_file_path(log_dir: &Path, now: DateTime<Local>) -> PathBuf {
    log_dir.join(format!("{}.log", now.format("%Y-%m-%dT%H%M%S")))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. With `print` the output goes to stderr,
/// otherwise to a timestamped file under `log_dir`. Installing twice is a
/// no-op.
pub fn init_tracing(level: Option<LogLevel>, log_dir: Option<PathBuf>, print: bool) -> LogGuard {
    let fallback = level.unwrap_or(LogLevel::Info).directive();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    if print {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
        return LogGuard {
            path: None,
            _worker: None,
        };
    }

    let log_dir = log_dir.unwrap_or_else(|| PathBuf::from("."));
    let log_path = log_file_path(&log_dir, Local::now());
    let _ = std::fs::create_dir_all(&log_dir);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path);

    match file {
        Ok(file) => {
            let (non_blocking, worker) = tracing_appender::non_blocking(file);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
                .try_init();
            LogGuard {
                path: Some(log_path),
                _worker: Some(worker),
            }
        }
        Err(_) => LogGuard {
            path: None,
            _worker: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn level_parsing_is_lossy() {
        assert_eq!(LogLevel::from_str_lossy("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str_lossy(" Warning "), LogLevel::Warn);
        assert_eq!(LogLevel::from_str_lossy("nonsense"), LogLevel::Info);
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }

    #[test]
    fn log_file_is_named_after_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();
        let path = log_file_path(dir.path(), now);
        assert_eq!(path.file_name().unwrap(), "2024-02-03T040506.log");
    }
}
