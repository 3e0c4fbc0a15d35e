//! Logging setup for the service and its workers.
//!
//! # Environment Variables
//!
//! - `POTAT_LOG` - Log filter (overrides RUST_LOG)
//! - `POTAT_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `POTAT_LOG_FORMAT` - Output format: pretty, compact, json
//! - `POTAT_LOG_FILE` - Path to a log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default)
    #[default]
    Pretty,
    /// Compact single-line format (workers use this on stderr)
    Compact,
    /// JSON format for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{s}'. Valid options: pretty, compact, json"
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Optional log file (daily rotation)
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level when set)
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Preset for the server process.
    pub fn for_server() -> Self {
        Self::default()
    }

    /// Preset for worker subprocesses: compact stderr lines the parent
    /// re-logs, quieter by default.
    pub fn for_worker() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            ..Self::default()
        }
    }

    /// Apply environment variable overrides. CLI-provided values (an
    /// already-set filter) take precedence.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("POTAT_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("POTAT_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("POTAT_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("POTAT_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{filter}', using default");
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global subscriber. Idempotent: later calls are ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let make_appender = |path: &PathBuf| {
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("potat-eval.log");
        RollingFileAppender::new(Rotation::DAILY, parent, file_name)
    };

    let result = match config.format {
        LogFormat::Json => {
            let file_layer = config.file_path.as_ref().map(|path| {
                fmt::layer()
                    .with_ansi(false)
                    .json()
                    .with_writer(make_appender(path))
            });
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(file_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let file_layer = config.file_path.as_ref().map(|path| {
                fmt::layer()
                    .with_ansi(false)
                    .compact()
                    .with_writer(make_appender(path))
            });
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .with(file_layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let file_layer = config.file_path.as_ref().map(|path| {
                fmt::layer().with_ansi(false).with_writer(make_appender(path))
            });
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(file_layer)
                .try_init()
        }
    };

    // Already initialized is fine.
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("nope"), None);
    }

    #[test]
    fn test_worker_preset() {
        let config = LogConfig::for_worker();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Compact);
    }
}
