//! Tracing setup for the command line.
//!
//! Interactive runs log to stderr only. Unattended runs (cron, CI) also write a daily
//! log file and keep only warnings on stderr, so stdout carries nothing but the summary.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PGBACKUP_LOG";

#[cfg(debug_assertions)]
const DEFAULT_FILTER: &str = "debug,pgbackup_core=trace,tokio_postgres=warn,deadpool=warn";
#[cfg(not(debug_assertions))]
const DEFAULT_FILTER: &str = "info,tokio_postgres=warn,deadpool=warn";

/// Where and how much to log.
pub struct LogConfig {
    /// Directory for daily log files in unattended runs.
    pub log_dir: PathBuf,
    /// Filter directive overriding `PGBACKUP_LOG` and `RUST_LOG`.
    pub log_filter: Option<String>,
    interactive: bool,
}

impl LogConfig {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, log_filter: None, interactive: atty::is(atty::Stream::Stderr) }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Keeps the file writer alive; dropping it flushes buffered lines.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A log directory that cannot be created degrades to stderr-only logging.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let filter = env_filter(config.log_filter.as_deref());

    if !config.interactive {
        match daily_appender(&config.log_dir) {
            Ok(appender) => {
                let (file, guard) = tracing_appender::non_blocking(appender);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr.with_max_level(tracing::Level::WARN).and(file))
                    .with_ansi(false)
                    .try_init();
                return LoggingGuard { _file: Some(guard) };
            }
            Err(e) => {
                eprintln!("Warning: cannot log to {}: {e}", config.log_dir.display());
            }
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    LoggingGuard { _file: None }
}

fn daily_appender(dir: &Path) -> Result<RollingFileAppender, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("pgbackup")
        .filename_suffix("log")
        .build(dir)?)
}

/// Explicit filter, then `PGBACKUP_LOG`, then `RUST_LOG`, then the build default.
fn env_filter(explicit: Option<&str>) -> EnvFilter {
    explicit
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_env(LOG_ENV).ok())
        .or_else(|| EnvFilter::try_from_env("RUST_LOG").ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Default log directory: next to the working directory in debug builds, the platform
/// data directory otherwise.
pub fn log_dir() -> PathBuf {
    let fallback = PathBuf::from("./pgbackup_data/logs");
    if cfg!(debug_assertions) {
        return fallback;
    }
    dirs::data_dir().map(|d| d.join("pgbackup").join("logs")).unwrap_or(fallback)
}
