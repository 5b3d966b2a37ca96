//! Logging infrastructure for DeskStream
//!
//! Structured logging through tracing. The capture loop logs every cycle
//! decision at debug level, so `info` is the sensible default for a running
//! host and `debug` for tuning the adaptation thresholds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Log level configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level - per-frame transport detail
    Trace,
    /// Debug level - per-cycle decisions
    Debug,
    /// Info level - lifecycle and control changes
    #[default]
    Info,
    /// Warn level - fail-open and dropped messages
    Warn,
    /// Error level - capture failures only
    Error,
}

impl LogLevel {
    /// Converts LogLevel to tracing level filter string
    fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Initializes the logging system
///
/// The default filter only covers this crate; `RUST_LOG` overrides it.
/// Calling this more than once is harmless; later calls are ignored.
///
/// # Examples
///
/// ```no_run
/// use desk_stream::logging::{init_logging, LogLevel};
///
/// init_logging(LogLevel::Debug);
///
/// // Or: RUST_LOG=desk_stream=trace cargo run
/// ```
pub fn init_logging(level: LogLevel) {
    let default_filter = format!("desk_stream={}", level.as_filter_str());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&default_filter));

    // The capture loop runs on a named thread
    let _ = subscriber_fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

/// Initializes logging with default settings
pub fn init_default_logging() {
    init_logging(LogLevel::default());
}
