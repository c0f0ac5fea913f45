//! librdkafka-backed broker connections
//!
//! [`KafkaSender`] wraps a `FutureProducer` and [`KafkaSource`] wraps a
//! `StreamConsumer` with auto-commit disabled, so offsets only move when the
//! consumer explicitly commits after successful processing.
//!
//! librdkafka calls into blocking C code for metadata, seeks and flushes;
//! those calls run on the blocking thread pool. High watermarks come from the
//! periodic client statistics instead of a broker round trip per poll.

use super::{DeliveryReceipt, MessageSender, MessageSource, PartitionBatch};
use crate::error::{CanaryError, Result};
use crate::logging::LogLevel;
use crate::message::{InboundMessage, OutboundMessage};
use crate::settings::KafkaSettings;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use futures::FutureExt;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::statistics::Statistics;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a send may wait for room in the local producer queue
const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on messages drained into one poll
const MAX_POLL_MESSAGES: usize = 500;
/// How often librdkafka reports statistics, and with them high watermarks
const STATISTICS_INTERVAL_MS: &str = "5000";

/// Builds the librdkafka client configuration shared by both sides
pub fn client_config(settings: &KafkaSettings, log_level: LogLevel) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &settings.host)
        .set("client.id", &settings.client_id)
        .set_log_level(log_level.into());

    let protocol = match (settings.ssl, settings.sasl.is_some()) {
        (false, false) => "plaintext",
        (true, false) => "ssl",
        (false, true) => "sasl_plaintext",
        (true, true) => "sasl_ssl",
    };
    config.set("security.protocol", protocol);

    if let Some(sasl) = &settings.sasl {
        config
            .set("sasl.mechanism", sasl.mechanism.as_rdkafka())
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }
    config
}

/// Client context that routes librdkafka's own logs into `tracing` and keeps
/// the high watermarks reported in the client statistics
pub struct CanaryContext {
    role: &'static str,
    watermarks: Mutex<HashMap<(String, i32), i64>>,
}

impl CanaryContext {
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Last high watermark reported for the partition
    pub fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.watermarks
            .lock()
            .ok()
            .and_then(|marks| marks.get(&(topic.to_string(), partition)).copied())
    }
}

impl ClientContext for CanaryContext {
    fn stats(&self, statistics: Statistics) {
        let Ok(mut marks) = self.watermarks.lock() else {
            return;
        };
        for (name, topic) in statistics.topics {
            for (partition, stats) in topic.partitions {
                // -1 is the unassigned partition; negative offsets are unknown
                if partition >= 0 && stats.hi_offset >= 0 {
                    marks.insert((name.clone(), partition), stats.hi_offset);
                }
            }
        }
    }

    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        let role = self.role;
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!(target: "librdkafka", role, facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Warning => {
                warn!(target: "librdkafka", role, facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(target: "librdkafka", role, facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Debug => {
                debug!(target: "librdkafka", role, facility = fac, "{}", log_message)
            }
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: "librdkafka", role = self.role, error = %error, "{}", reason);
    }
}

impl ConsumerContext for CanaryContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(partitions = ?partition_ids(partitions), "Partitions revoked")
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!(error = %e, "Rebalance failed"),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!(partitions = ?partition_ids(partitions), "Partitions assigned");
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = %e, partitions = ?partition_ids(offsets), "Offset commit failed");
        }
    }
}

fn partition_ids(list: &TopicPartitionList) -> Vec<i32> {
    list.elements().iter().map(|e| e.partition()).collect()
}

fn not_connected(role: &str) -> CanaryError {
    CanaryError::Connection(format!("{} is not connected", role))
}

/// Runs a blocking librdkafka call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CanaryError::Broker(format!("Blocking broker call panicked: {}", e)))?
        .map_err(CanaryError::from)
}

/// Producing connection
pub struct KafkaSender {
    config: ClientConfig,
    producer: Mutex<Option<FutureProducer<CanaryContext>>>,
}

impl KafkaSender {
    pub fn new(settings: &KafkaSettings, log_level: LogLevel) -> Self {
        let mut config = client_config(settings, log_level);
        config.set("message.timeout.ms", "30000");
        Self {
            config,
            producer: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<FutureProducer<CanaryContext>> {
        self.producer.lock().ok().and_then(|p| p.clone())
    }
}

#[async_trait]
impl MessageSender for KafkaSender {
    async fn connect(&self) -> Result<()> {
        let producer: FutureProducer<CanaryContext> = self
            .config
            .create_with_context(CanaryContext::new("producer"))
            .map_err(|e| CanaryError::Connection(e.to_string()))?;

        // librdkafka connects lazily; a metadata round trip proves the broker is reachable
        let handle = producer.clone();
        blocking(move || handle.client().fetch_metadata(None, METADATA_TIMEOUT))
            .await
            .map_err(|e| CanaryError::Connection(e.to_string()))?;

        if let Ok(mut slot) = self.producer.lock() {
            *slot = Some(producer);
        }
        info!("Producer connected");
        Ok(())
    }

    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<Vec<DeliveryReceipt>> {
        let producer = self.current().ok_or_else(|| not_connected("producer"))?;

        let deliveries = messages.iter().map(|message| {
            let record = FutureRecord::<(), [u8]>::to(topic)
                .payload(&message.payload[..])
                .timestamp(message.produced_at_epoch_ms);
            producer.send(record, Timeout::After(QUEUE_TIMEOUT))
        });

        join_all(deliveries)
            .await
            .into_iter()
            .map(|delivery| match delivery {
                Ok((partition, offset)) => Ok(DeliveryReceipt { partition, offset }),
                Err((e, _)) => Err(CanaryError::Send(e.to_string())),
            })
            .collect()
    }

    async fn disconnect(&self) -> Result<()> {
        let producer = match self.producer.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(producer) = producer {
            blocking(move || producer.flush(FLUSH_TIMEOUT))
                .await
                .map_err(|e| CanaryError::Connection(e.to_string()))?;
            info!("Producer disconnected");
        }
        Ok(())
    }
}

/// Consuming connection for one consumer group
pub struct KafkaSource {
    config: ClientConfig,
    consumer: Mutex<Option<Arc<StreamConsumer<CanaryContext>>>>,
    closed: CancellationToken,
}

impl KafkaSource {
    pub fn new(settings: &KafkaSettings, group_id: &str, log_level: LogLevel) -> Self {
        let mut config = client_config(settings, log_level);
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .set("statistics.interval.ms", STATISTICS_INTERVAL_MS);
        Self {
            config,
            consumer: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    fn current(&self) -> Option<Arc<StreamConsumer<CanaryContext>>> {
        self.consumer.lock().ok().and_then(|c| c.clone())
    }

    fn replace(&self, consumer: Option<Arc<StreamConsumer<CanaryContext>>>) -> Option<Arc<StreamConsumer<CanaryContext>>> {
        match self.consumer.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, consumer),
            Err(_) => None,
        }
    }

    /// Creates a consumer; the reset policy only applies to partitions
    /// without a committed group offset
    fn create(&self, from_beginning: bool) -> Result<StreamConsumer<CanaryContext>> {
        let mut config = self.config.clone();
        config.set(
            "auto.offset.reset",
            if from_beginning { "earliest" } else { "latest" },
        );
        config
            .create_with_context(CanaryContext::new("consumer"))
            .map_err(|e| CanaryError::Connection(e.to_string()))
    }

}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        raw_payload: Bytes::copy_from_slice(message.payload().unwrap_or(&[])),
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn connect(&self) -> Result<()> {
        let consumer = Arc::new(self.create(true)?);
        let client = Arc::clone(&consumer);
        blocking(move || client.fetch_metadata(None, METADATA_TIMEOUT))
            .await
            .map_err(|e| CanaryError::Connection(e.to_string()))?;
        self.replace(Some(consumer));
        info!("Consumer connected");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<()> {
        if self.current().is_none() {
            return Err(not_connected("consumer"));
        }
        if !from_beginning {
            // connect() builds with the earliest reset policy
            self.replace(Some(Arc::new(self.create(false)?)));
        }
        let consumer = self.current().ok_or_else(|| not_connected("consumer"))?;
        consumer.subscribe(&[topic])?;
        info!(topic, from_beginning, "Subscribed");
        Ok(())
    }

    async fn poll_batch(&self) -> Result<Option<Vec<PartitionBatch>>> {
        let consumer = match self.current() {
            Some(consumer) => consumer,
            None => return Ok(None),
        };

        let mut messages = Vec::new();
        tokio::select! {
            _ = self.closed.cancelled() => return Ok(None),
            received = consumer.recv() => {
                messages.push(to_inbound(&received?));
            }
        }

        // Drain whatever is already buffered without waiting again
        while messages.len() < MAX_POLL_MESSAGES {
            match consumer.recv().now_or_never() {
                Some(Ok(message)) => messages.push(to_inbound(&message)),
                Some(Err(e)) => {
                    warn!(error = %e, "Error while draining fetched messages");
                    break;
                }
                None => break,
            }
        }

        let mut by_partition: BTreeMap<(String, i32), Vec<InboundMessage>> = BTreeMap::new();
        for message in messages {
            by_partition
                .entry((message.topic.clone(), message.partition))
                .or_default()
                .push(message);
        }

        let batches = by_partition
            .into_iter()
            .map(|((topic, partition), messages)| {
                let mut batch = PartitionBatch {
                    topic,
                    partition,
                    high_watermark: 0,
                    messages,
                };
                // The reported watermark may lag behind what was just fetched
                let fetched = batch.last_offset().map_or(0, |offset| offset + 1);
                batch.high_watermark = consumer
                    .context()
                    .high_watermark(&batch.topic, partition)
                    .map_or(fetched, |reported| reported.max(fetched));
                batch
            })
            .collect();
        Ok(Some(batches))
    }

    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let consumer = self.current().ok_or_else(|| not_connected("consumer"))?;
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let consumer = self.current().ok_or_else(|| not_connected("consumer"))?;
        let topic = topic.to_string();
        blocking(move || consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.cancel();
        if let Some(consumer) = self.replace(None) {
            consumer.unsubscribe();
            info!("Consumer disconnected");
        }
        Ok(())
    }
}
