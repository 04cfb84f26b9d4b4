//! Structured logging initialization.
//!
//! Console logs go to stderr by default so the rendered report on stdout
//! stays machine-consumable. An optional daily-rolling file sink can be
//! enabled via `FSWEEP_LOG_FILE`.

use anyhow::Result;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_subscriber::{
    fmt,
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-friendly, pretty-printed logs.
    Pretty,
    /// JSON-formatted logs for machine parsing.
    Json,
    /// Compact single-line logs.
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (trace, debug, info, warn, error, off).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Optional file path for rotating logs.
    pub file_path: Option<PathBuf>,
    /// Write console logs to stderr instead of stdout.
    pub use_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            file_path: None,
            use_stderr: true,
        }
    }
}

impl LogConfig {
    /// Build a logging configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - FSWEEP_LOG_LEVEL
    /// - FSWEEP_LOG_FORMAT (pretty|json|compact)
    /// - FSWEEP_LOG_FILE (path to rotating log file)
    pub fn from_env(default_level: &str) -> Self {
        let mut config = Self {
            level: std::env::var("FSWEEP_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string()),
            ..Self::default()
        };

        if let Ok(format) = std::env::var("FSWEEP_LOG_FORMAT") {
            if let Some(parsed) = LogFormat::parse(&format) {
                config.format = parsed;
            }
        }

        if let Ok(path) = std::env::var("FSWEEP_LOG_FILE") {
            if !path.trim().is_empty() {
                config.file_path = Some(PathBuf::from(path));
            }
        }

        config
    }

    /// Build the effective EnvFilter, honoring RUST_LOG if set.
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some() {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return filter;
            }
        }
        EnvFilter::new(self.level.clone())
    }
}

/// Guards required to keep background logging workers alive.
pub struct LoggingGuards {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize tracing-based logging for the current process.
///
/// Returns guards that must be kept alive for the duration of the program
/// (particularly when file logging is enabled).
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = config.env_filter();
    let (writer, file_guard) = build_writer(config)?;
    let ansi = file_guard.is_none();

    match config.format {
        LogFormat::Pretty => {
            let subscriber = fmt::Subscriber::builder()
                .with_writer(writer)
                .with_env_filter(filter)
                .with_ansi(ansi)
                .pretty()
                .finish();
            finish_subscriber(subscriber, file_guard)
        }
        LogFormat::Json => {
            let subscriber = fmt::Subscriber::builder()
                .with_writer(writer)
                .with_env_filter(filter)
                .with_ansi(false)
                .json()
                .finish();
            finish_subscriber(subscriber, file_guard)
        }
        LogFormat::Compact => {
            let subscriber = fmt::Subscriber::builder()
                .with_writer(writer)
                .with_env_filter(filter)
                .with_ansi(ansi)
                .compact()
                .finish();
            finish_subscriber(subscriber, file_guard)
        }
    }
}

fn build_writer(
    config: &LogConfig,
) -> Result<(
    BoxMakeWriter,
    Option<tracing_appender::non_blocking::WorkerGuard>,
)> {
    let base_writer = if config.use_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    if let Some(path) = config.file_path.as_ref() {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().unwrap_or_else(|| OsStr::new("fsweep.log"));
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let writer = BoxMakeWriter::new(base_writer.and(non_blocking));
        Ok((writer, Some(guard)))
    } else {
        Ok((base_writer, None))
    }
}

fn finish_subscriber<S>(
    subscriber: S,
    file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
) -> Result<LoggingGuards>
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = subscriber.try_init() {
        if err.to_string().contains("already initialized") {
            return Ok(LoggingGuards {
                _file_guard: file_guard,
            });
        }
        return Err(err.into());
    }

    Ok(LoggingGuards {
        _file_guard: file_guard,
    })
}
