//! kafka-canary - synthetic Kafka workload
//!
//! A producer that sends randomly sized batches on a fixed cadence and a
//! consumer-group member that processes them with random delays and injected
//! failures, so brokers, rebalances and redelivery are exercised continuously.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod reporting;
pub mod server;
pub mod settings;
pub mod utils;
pub mod workload;

pub use error::{CanaryError, Result};

/// Service name used in logs and metrics
pub const SERVICE_NAME: &str = "kafka-canary";
