//! Logging configuration and initialization
//!
//! Centralized logging setup on the `tracing` ecosystem, supporting
//! human-readable and JSON output. Filtering follows the usual precedence:
//! `RUST_LOG` wins, then `NPU_ALLOC_LOG_LEVEL`, then the default.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. "info", "npualloc=debug")
//! - `NPU_ALLOC_LOG_LEVEL`: simple level (error, warn, info, debug, trace)
//! - `NPU_ALLOC_LOG_FORMAT`: output format ("human" or "json")

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "NPU_ALLOC_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "NPU_ALLOC_LOG_FORMAT";

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output for log aggregation
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize logging from the environment. Idempotent; safe to call from
/// multiple threads and multiple embedding layers.
pub fn init_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|value| LogLevel::parse(&value))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|value| LogFormat::parse(&value))
            .unwrap_or_default();

        let env_filter = match std::env::var("RUST_LOG") {
            Ok(filter) => EnvFilter::try_new(filter)
                .unwrap_or_else(|_| EnvFilter::new(level.as_filter_str())),
            Err(_) => EnvFilter::new(level.as_filter_str()),
        };

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_target(true))
                .try_init(),
            LogFormat::Human => registry
                .with(fmt::layer().with_target(true).with_thread_ids(false))
                .try_init(),
        };
        // Another subscriber may already be installed by the embedding
        // runtime; that is fine.
        let _ = result;
    });
}

/// Check if this module installed (or attempted to install) the subscriber.
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_idempotent() {
        init_logging();
        init_logging();
        assert!(is_initialized());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("human"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("structured"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("yaml"), None);
    }
}
