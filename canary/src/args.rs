//! Command-line arguments for the canary
//!
//! Flags override individual keys of the settings file; everything else
//! comes from the file.

use clap::Parser;
use kafka_canary::logging::{LogFormat, LogLevel};
use kafka_canary::settings::Settings;
use std::path::PathBuf;

/// Command-line arguments for running the canary workload
#[derive(Parser, Debug)]
#[command(name = "kafka-canary")]
#[command(about = "Synthetic Kafka canary: randomized producer and fault-injecting consumer group")]
pub struct Args {
    /// Settings file (TOML)
    #[arg(short, long, env = "CANARY_CONFIG", default_value = "config/default.toml")]
    pub config: PathBuf,

    /// Override logLevel (debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Override logFormat ("pretty" for humans, anything else for JSON)
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Override the liveness server port
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Override kafka.host (comma-separated bootstrap brokers)
    #[arg(short, long, env = "KAFKA_BROKERS")]
    pub broker: Option<String>,

    /// Run against a built-in in-memory broker instead of Kafka
    #[arg(long, default_value = "false")]
    pub in_memory: bool,

    /// Call the liveness endpoint and exit 0 when it answers, 1 otherwise
    #[arg(long, default_value = "false")]
    pub healthcheck: bool,
}

impl Args {
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(level) = self.log_level {
            settings.log_level = level;
        }
        if let Some(format) = self.log_format {
            settings.log_format = format;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(broker) = &self.broker {
            settings.kafka.host = broker.clone();
        }
    }
}
