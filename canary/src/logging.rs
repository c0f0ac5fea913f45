//! Structured logging setup
//!
//! The service logs through `tracing`. Output is either JSON lines (the
//! default, for log shippers) or a human-readable format for local runs.
//! `RUST_LOG` overrides the configured level when set.

use crate::error::{CanaryError, Result};
use rdkafka::config::RDKafkaLogLevel;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::filter::EnvFilter;

/// Minimum severity that reaches the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, String> {
        value.parse()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl From<LogLevel> for RDKafkaLogLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => RDKafkaLogLevel::Debug,
            LogLevel::Info => RDKafkaLogLevel::Info,
            LogLevel::Warn => RDKafkaLogLevel::Warning,
            LogLevel::Error => RDKafkaLogLevel::Error,
        }
    }
}

/// Output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl From<String> for LogFormat {
    // Anything but "pretty" means JSON
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(LogFormat::from(s.to_string()))
    }
}

/// Installs the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn setup_logging(level: LogLevel, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let installed = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(false)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init(),
    };
    installed.map_err(|e| CanaryError::Config(format!("Failed to install logger: {}", e)))
}
