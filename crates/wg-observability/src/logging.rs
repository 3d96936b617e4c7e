//! Logging infrastructure for Wallet Guard.
//!
//! Structured logging on top of `tracing`. Every control-plane decision is
//! emitted with `wallet_id` / `tx_id` fields so that a single wallet's history
//! can be filtered out of the stream.

use serde::Deserialize;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Errors raised while installing the global subscriber.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    #[error("Failed to install tracing subscriber: {0}")]
    InitFailed(String),
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level for the control-plane crates.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Whether to include span open/close events.
    pub include_spans: bool,
    /// Whether to include file/line info.
    pub include_location: bool,
    /// Whether to include thread IDs.
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Plain,
            include_spans: false,
            include_location: true,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    /// Creates a development configuration with more verbose output.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Plain,
            include_spans: true,
            include_location: true,
            include_thread_ids: true,
        }
    }

    /// Creates a production configuration with JSON output.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
        }
    }

    /// Builds a configuration from the `logging` section of the config file.
    pub fn from_settings(level: &str, format: LogFormat) -> Result<Self, LoggingError> {
        let level: Level = level
            .parse()
            .map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;
        let base = match format {
            LogFormat::Json => Self::production(),
            LogFormat::Plain => Self::default(),
        };
        Ok(Self { level, ..base })
    }

    fn default_filter(&self) -> String {
        ["wg_core", "wg_policy", "wg_observability"]
            .iter()
            .map(|target| format!("{}={}", target, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Initializes the logging system with default configuration.
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LoggingConfig::default())
}

/// Initializes the logging system with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging_with_config(config: LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread_ids);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Plain => {
            let fmt_layer = fmt::layer()
                .with_span_events(span_events)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread_ids);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    result.map_err(|e| LoggingError::InitFailed(e.to_string()))
}

/// Creates a span for work on one wallet.
#[macro_export]
macro_rules! wallet_span {
    ($wallet_id:expr) => {
        tracing::info_span!("wallet", wallet_id = %$wallet_id)
    };
    ($wallet_id:expr, $($field:tt)*) => {
        tracing::info_span!("wallet", wallet_id = %$wallet_id, $($field)*)
    };
}

/// Creates a span for work on one transaction.
#[macro_export]
macro_rules! tx_span {
    ($wallet_id:expr, $tx_id:expr) => {
        tracing::info_span!("transaction", wallet_id = %$wallet_id, tx_id = %$tx_id)
    };
}
