//! Service configuration
//!
//! Settings come from a TOML file with camelCase keys, e.g.
//!
//! ```toml
//! logLevel = "info"
//!
//! [kafka]
//! host = "localhost:9092"
//! clientId = "kafka-canary"
//!
//! [producer]
//! topic = "canary"
//! interval = 1000
//! minMessages = 1
//! maxMessages = 10
//! ```
//!
//! Command-line flags override individual keys after loading.

use crate::consumer::ConsumerConfig;
use crate::error::{CanaryError, Result};
use crate::logging::{LogFormat, LogLevel};
use crate::message::PayloadShape;
use crate::metrics::MetricsSettings;
use crate::producer::ProducerConfig;
use crate::reporting::SentrySettings;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub server: ServerSettings,
    pub kafka: KafkaSettings,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub sentry: SentrySettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
}

pub const DEFAULT_PORT: u16 = 8080;

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSettings {
    /// Comma-separated bootstrap brokers
    pub host: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub sasl: Option<SaslSettings>,
}

fn default_client_id() -> String {
    crate::SERVICE_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaslSettings {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "plain", alias = "PLAIN")]
    Plain,
    #[serde(rename = "scram-sha-256", alias = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "scram-sha-512", alias = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_rdkafka(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSettings {
    pub topic: String,
    /// Milliseconds between batch starts
    #[serde(alias = "sendIntervalMs")]
    pub interval: u64,
    pub min_messages: usize,
    pub max_messages: usize,
    #[serde(default)]
    pub payload_shape: PayloadShape,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSettings {
    pub group_id: String,
    pub topic: String,
    #[serde(default)]
    pub min_duration: u64,
    #[serde(default)]
    pub max_duration: u64,
    #[serde(default)]
    pub error_chance: f64,
    #[serde(default = "default_from_beginning")]
    pub from_beginning: bool,
}

fn default_from_beginning() -> bool {
    true
}

impl Settings {
    /// Reads and validates a settings file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CanaryError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let settings = Self::from_toml(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings without validating them
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CanaryError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.host.trim().is_empty() {
            return Err(CanaryError::Config("kafka.host must not be empty".into()));
        }
        self.producer_config().validate()?;
        self.consumer_config().validate()
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            topic: self.producer.topic.clone(),
            send_interval_ms: self.producer.interval,
            min_batch_size: self.producer.min_messages,
            max_batch_size: self.producer.max_messages,
            payload_shape: self.producer.payload_shape,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            group_id: self.consumer.group_id.clone(),
            topic: self.consumer.topic.clone(),
            min_processing_delay_ms: self.consumer.min_duration,
            max_processing_delay_ms: self.consumer.max_duration,
            synthetic_failure_probability: self.consumer.error_chance,
            from_beginning: self.consumer.from_beginning,
        }
    }
}
