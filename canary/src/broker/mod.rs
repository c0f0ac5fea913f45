//! Broker connection seam
//!
//! The producer and consumer never talk to a broker client directly. They own
//! a [`MessageSender`] or [`MessageSource`], which the process wires to either
//! the librdkafka-backed implementation in [`kafka`] or the in-memory broker in
//! [`memory`]. Each connection is owned by exactly one component.

pub mod kafka;
pub mod memory;

use crate::error::Result;
use crate::message::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use std::time::Duration;

/// Broker acknowledgement for one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Messages fetched from one partition, in partition order
#[derive(Debug, Clone)]
pub struct PartitionBatch {
    pub topic: String,
    pub partition: i32,
    /// Offset the next produced message on this partition will get
    pub high_watermark: i64,
    pub messages: Vec<InboundMessage>,
}

impl PartitionBatch {
    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset)
    }

    /// Remaining messages behind `next_offset` on this partition
    pub fn lag_after(&self, next_offset: i64) -> i64 {
        (self.high_watermark - next_offset).max(0)
    }
}

/// Producing side of a broker connection
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Establishes the connection. Not retried internally.
    async fn connect(&self) -> Result<()>;

    /// Sends one batch to `topic`, resolving once every message is acknowledged
    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<Vec<DeliveryReceipt>>;

    /// Tears down the connection. Calling it on a closed sender is a no-op.
    async fn disconnect(&self) -> Result<()>;
}

/// Consuming side of a broker connection, bound to one consumer group
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Joins the group and subscribes to `topic`
    ///
    /// With `from_beginning`, partitions without a committed group offset
    /// start at the earliest available offset.
    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<()>;

    /// Waits for the next set of partition batches
    ///
    /// Returns `Ok(None)` once the source has been disconnected, which ends the
    /// subscription. Each partition appears at most once per call.
    async fn poll_batch(&self) -> Result<Option<Vec<PartitionBatch>>>;

    /// Commits `next_offset` as the group position for a partition
    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;

    /// Moves the fetch position back so `offset` is delivered again
    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Leaves the group and closes the connection. Safe to call twice.
    async fn disconnect(&self) -> Result<()>;
}

/// Backoff applied before a failed message is redelivered
///
/// Doubles per consecutive failure of the same message, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedeliveryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(300),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RedeliveryPolicy {
    /// No backoff at all; used by tests and the in-memory demo
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Backoff before redelivery number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled_ms = (self.initial.as_millis() as f64 * self.multiplier.powi(exponent)).round();
        Duration::from_millis(scaled_ms.min(self.max.as_millis() as f64) as u64)
    }
}
