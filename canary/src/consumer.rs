//! Fault-injecting canary consumer
//!
//! This module contains the `Consumer`, a consumer-group member that
//! processes every message of its topic with a random delay and a configured
//! chance of a synthetic failure. Partitions are processed concurrently, at
//! most [`PARTITIONS_CONSUMED_CONCURRENTLY`] at a time, and in order within a
//! partition. An offset is committed only after its message was processed; a
//! failed message is redelivered after the [`RedeliveryPolicy`] backoff.

use crate::broker::{MessageSource, PartitionBatch, RedeliveryPolicy};
use crate::error::{CanaryError, Result};
use crate::message::{parse_payload, InboundMessage};
use crate::metrics::OFFSET_LAG;
use crate::reporting::ErrorReporter;
use crate::utils::{delay, random_between, random_unit};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use metrics::gauge;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

pub const PARTITIONS_CONSUMED_CONCURRENTLY: usize = 2;

/// Error text of injected failures
pub const SYNTHETIC_FAILURE_MESSAGE: &str = "Synthetic error to simulate failures";

/// Consecutive failed polls tolerated before `run` gives up
const MAX_POLL_FAILURES: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topic: String,
    pub min_processing_delay_ms: u64,
    pub max_processing_delay_ms: u64,
    /// Chance in `[0, 1]` that a message fails on purpose
    pub synthetic_failure_probability: f64,
    /// Start partitions without a committed offset at the earliest message
    pub from_beginning: bool,
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(CanaryError::Config("consumer.groupId must not be empty".into()));
        }
        if self.topic.trim().is_empty() {
            return Err(CanaryError::Config("consumer.topic must not be empty".into()));
        }
        if self.min_processing_delay_ms > self.max_processing_delay_ms {
            return Err(CanaryError::Config(format!(
                "consumer.minDuration ({}) exceeds consumer.maxDuration ({})",
                self.min_processing_delay_ms, self.max_processing_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.synthetic_failure_probability) {
            return Err(CanaryError::Config(format!(
                "consumer.errorChance must be within [0, 1], got {}",
                self.synthetic_failure_probability
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Connected,
    Running,
    Stopped,
}

/// Lag left on a partition after one processed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerLagSample {
    pub topic: String,
    pub partition: i32,
    pub lag: i64,
}

/// Called after each processed partition batch
#[async_trait]
pub trait BatchObserver: Send + Sync {
    fn on_batch_processed(&self, sample: &ConsumerLagSample);

    /// Releases resources; called once from [`Consumer::stop`]
    async fn shutdown(&self) {}
}

/// Records lag samples on the `OffsetLag` gauge
pub struct LagMetricObserver;

#[async_trait]
impl BatchObserver for LagMetricObserver {
    fn on_batch_processed(&self, sample: &ConsumerLagSample) {
        gauge!(
            OFFSET_LAG,
            "Topic" => sample.topic.clone(),
            "Partition" => sample.partition.to_string()
        )
        .set(sample.lag as f64);
    }
}

pub struct Consumer {
    source: Arc<dyn MessageSource>,
    config: ConsumerConfig,
    reporter: Arc<dyn ErrorReporter>,
    observer: Option<Arc<dyn BatchObserver>>,
    redelivery: RedeliveryPolicy,
    state: Mutex<ConsumerState>,
    /// partition -> (failed offset, consecutive failures of that offset)
    failures: Mutex<HashMap<i32, (i64, u32)>>,
}

impl Consumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        config: ConsumerConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            reporter,
            observer: None,
            redelivery: RedeliveryPolicy::default(),
            state: Mutex::new(ConsumerState::Created),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConsumerState::Stopped)
    }

    fn transition(&self, from: ConsumerState, to: ConsumerState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CanaryError::InvalidState("consumer state lock poisoned".into()))?;
        if *state != from {
            return Err(CanaryError::InvalidState(format!(
                "cannot move consumer from {:?} to {:?}",
                *state, to
            )));
        }
        *state = to;
        Ok(())
    }

    pub async fn connect(&self) -> Result<()> {
        if self.state() != ConsumerState::Created {
            return Err(CanaryError::InvalidState(format!(
                "cannot connect a consumer in state {:?}",
                self.state()
            )));
        }
        self.source.connect().await?;
        self.transition(ConsumerState::Created, ConsumerState::Connected)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.source.disconnect().await
    }

    /// Subscribes and processes messages until the subscription ends
    ///
    /// Returns `Ok(())` once the consumer is stopped. Fails if the consumer
    /// is not connected, if subscribing fails, or if polling keeps failing.
    pub async fn run(&self) -> Result<()> {
        self.transition(ConsumerState::Connected, ConsumerState::Running)?;
        self.source
            .subscribe(&self.config.topic, self.config.from_beginning)
            .await?;
        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "Consumer running"
        );

        let mut poll_failures = 0;
        loop {
            match self.source.poll_batch().await {
                Ok(Some(batches)) => {
                    poll_failures = 0;
                    stream::iter(batches)
                        .for_each_concurrent(PARTITIONS_CONSUMED_CONCURRENTLY, |batch| {
                            self.process_partition_batch(batch)
                        })
                        .await;
                }
                Ok(None) => break,
                Err(e) => {
                    poll_failures += 1;
                    if poll_failures >= MAX_POLL_FAILURES {
                        error!(error = %e, attempts = poll_failures, "Giving up on fetching messages");
                        return Err(e);
                    }
                    warn!(error = %e, attempt = poll_failures, "Failed to fetch messages");
                    delay(self.redelivery.backoff(poll_failures).as_millis() as u64).await;
                }
            }
        }
        info!(topic = %self.config.topic, "Consumer subscription ended");
        Ok(())
    }

    async fn process_partition_batch(&self, batch: PartitionBatch) {
        let topic = batch.topic.clone();
        let partition = batch.partition;
        let mut next_offset = None;
        let mut failed_at = None;

        for message in &batch.messages {
            let offset = message.offset;
            match self.handle_message(message.clone()).await {
                Ok(()) => {
                    next_offset = Some(offset + 1);
                    self.clear_failure(partition, offset);
                }
                Err(e) => {
                    match &e {
                        CanaryError::SyntheticFailure(_) => {
                            warn!(topic = %topic, partition, offset, error = %e, "Message processing failed")
                        }
                        _ => {
                            error!(topic = %topic, partition, offset, kind = e.kind(), error = %e, "Message processing failed")
                        }
                    }
                    failed_at = Some(offset);
                    break;
                }
            }
        }

        if let Some(next) = next_offset {
            if let Err(e) = self.source.commit(&topic, partition, next).await {
                warn!(topic = %topic, partition, next_offset = next, error = %e, "Failed to commit offset");
                self.reporter.capture(&e);
            }
        }

        let position = match failed_at {
            Some(offset) => {
                let attempt = self.record_failure(partition, offset);
                let backoff = self.redelivery.backoff(attempt);
                debug!(topic = %topic, partition, offset, attempt, backoff_ms = backoff.as_millis() as u64, "Redelivering message");
                delay(backoff.as_millis() as u64).await;
                if let Err(e) = self.source.rewind(&topic, partition, offset).await {
                    warn!(topic = %topic, partition, offset, error = %e, "Failed to rewind partition");
                    self.reporter.capture(&e);
                }
                offset
            }
            None => next_offset.unwrap_or(batch.high_watermark),
        };

        if let Some(observer) = &self.observer {
            observer.on_batch_processed(&ConsumerLagSample {
                topic,
                partition,
                lag: batch.lag_after(position),
            });
        }
    }

    fn record_failure(&self, partition: i32, offset: i64) -> u32 {
        let Ok(mut failures) = self.failures.lock() else {
            return 1;
        };
        let entry = failures.entry(partition).or_insert((offset, 0));
        if entry.0 != offset {
            *entry = (offset, 0);
        }
        entry.1 += 1;
        entry.1
    }

    fn clear_failure(&self, partition: i32, offset: i64) {
        if let Ok(mut failures) = self.failures.lock() {
            if failures.get(&partition).is_some_and(|(failed, _)| *failed == offset) {
                failures.remove(&partition);
            }
        }
    }

    /// Processing delay for one message, drawn from the configured range
    pub fn draw_processing_delay(&self) -> u64 {
        random_between(
            self.config.min_processing_delay_ms,
            self.config.max_processing_delay_ms,
        )
    }

    /// Rolls the synthetic failure die; `0` never fails and `1` always does
    pub fn roll_synthetic_failure(&self) -> bool {
        let p = self.config.synthetic_failure_probability;
        p > 0.0 && random_unit() <= p
    }

    /// Processes one message
    ///
    /// # Returns
    /// * `Err(CanaryError::SyntheticFailure)` - When the failure roll hits
    /// * `Err(CanaryError::Parse)` - When the payload is not a JSON object;
    ///   the error is also reported
    pub async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        self.reporter.breadcrumb(
            "Consuming message",
            serde_json::json!({
                "topic": message.topic,
                "partition": message.partition,
                "offset": message.offset,
            }),
        );

        delay(self.draw_processing_delay()).await;

        if self.roll_synthetic_failure() {
            return Err(CanaryError::SyntheticFailure(
                SYNTHETIC_FAILURE_MESSAGE.to_string(),
            ));
        }

        let event = match parse_payload(&message.raw_payload) {
            Ok(event) => event,
            Err(e) => {
                self.reporter.capture(&e);
                return Err(e);
            }
        };

        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            event = %serde_json::Value::Object(event),
            "Consumed message"
        );
        Ok(())
    }

    /// Disconnects and shuts the observer down. Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, ConsumerState::Stopped),
            Err(_) => ConsumerState::Stopped,
        };
        info!("Stopping consumer");
        let disconnected = self.disconnect().await;
        if previous != ConsumerState::Stopped {
            if let Some(observer) = &self.observer {
                observer.shutdown().await;
            }
        }
        disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::MessageSender;
    use crate::message::{build_batch, PayloadShape};
    use crate::metrics::{Dimension, EmfRecorder};
    use crate::reporting::{SentrySettings, TracingReporter};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(min: u64, max: u64, p: f64) -> ConsumerConfig {
        ConsumerConfig {
            group_id: "canary-group".into(),
            topic: "canary".into(),
            min_processing_delay_ms: min,
            max_processing_delay_ms: max,
            synthetic_failure_probability: p,
            from_beginning: true,
        }
    }

    fn reporter() -> Arc<TracingReporter> {
        Arc::new(TracingReporter::new(&SentrySettings {
            enabled: true,
            dsn: None,
        }))
    }

    fn consumer(broker: &Arc<MemoryBroker>, config: ConsumerConfig) -> Consumer {
        Consumer::new(Arc::new(broker.source("canary-group")), config, reporter())
            .unwrap()
            .with_redelivery(RedeliveryPolicy::immediate())
    }

    fn inbound(payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            topic: "canary".into(),
            partition: 0,
            offset: 0,
            raw_payload: Bytes::from_static(payload),
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        samples: Mutex<Vec<ConsumerLagSample>>,
        shutdowns: Mutex<u32>,
    }

    #[async_trait]
    impl BatchObserver for RecordingObserver {
        fn on_batch_processed(&self, sample: &ConsumerLagSample) {
            self.samples.lock().unwrap().push(sample.clone());
        }

        async fn shutdown(&self) {
            *self.shutdowns.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_lag_observer_sets_gauge_per_partition() {
        let recorder = EmfRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            for (partition, lag) in [(0, 4), (1, 0), (0, 1)] {
                LagMetricObserver.on_batch_processed(&ConsumerLagSample {
                    topic: "canary".into(),
                    partition,
                    lag,
                });
            }
        });

        let lags: Vec<(Vec<Dimension>, Vec<f64>)> = recorder
            .handle()
            .snapshot()
            .into_iter()
            .filter(|s| s.name == OFFSET_LAG)
            .map(|s| (s.dimensions, s.values))
            .collect();
        assert_eq!(
            lags,
            vec![
                (
                    vec![Dimension::new("Topic", "canary"), Dimension::new("Partition", 0)],
                    vec![1.0]
                ),
                (
                    vec![Dimension::new("Topic", "canary"), Dimension::new("Partition", 1)],
                    vec![0.0]
                ),
            ]
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(config(0, 0, 0.0).validate().is_ok());
        assert!(config(10, 5, 0.0).validate().is_err());
        assert!(config(0, 5, 1.01).validate().is_err());
        assert!(config(0, 5, -0.1).validate().is_err());
    }

    #[test]
    fn test_processing_delay_in_range() {
        let broker = MemoryBroker::new(1);
        let consumer = consumer(&broker, config(10, 20, 0.0));
        for _ in 0..1000 {
            assert!((10..=20).contains(&consumer.draw_processing_delay()));
        }
    }

    #[tokio::test]
    async fn test_handler_waits_at_least_min_delay() {
        let broker = MemoryBroker::new(1);
        let consumer = consumer(&broker, config(30, 30, 0.0));
        let start = Instant::now();
        consumer.handle_message(inbound(b"{}")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_certain_failure_always_fails() {
        let broker = MemoryBroker::new(1);
        let consumer = consumer(&broker, config(0, 0, 1.0));
        for _ in 0..100 {
            let err = consumer.handle_message(inbound(b"{}")).await.unwrap_err();
            assert_eq!(err.to_string(), format!("Synthetic failure: {}", SYNTHETIC_FAILURE_MESSAGE));
        }
    }

    #[tokio::test]
    async fn test_zero_chance_never_fails() {
        let broker = MemoryBroker::new(1);
        let consumer = consumer(&broker, config(0, 0, 0.0));
        for _ in 0..1000 {
            consumer.handle_message(inbound(br#"{"a":1}"#)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_half_chance_fails_about_half_the_time() {
        let broker = MemoryBroker::new(1);
        let consumer = consumer(&broker, config(0, 0, 0.5));
        let mut failures = 0;
        for _ in 0..1000 {
            if consumer.handle_message(inbound(b"{}")).await.is_err() {
                failures += 1;
            }
        }
        assert!((450..=550).contains(&failures), "failures = {}", failures);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_reported() {
        let broker = MemoryBroker::new(1);
        let reporter = reporter();
        let consumer = Consumer::new(
            Arc::new(broker.source("canary-group")),
            config(0, 0, 0.0),
            reporter.clone(),
        )
        .unwrap();
        let err = consumer.handle_message(inbound(b"not json")).await.unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        assert_eq!(reporter.captured(), 1);
        assert_eq!(reporter.breadcrumbs().len(), 1);
    }

    #[tokio::test]
    async fn test_state_machine() {
        let broker = MemoryBroker::new(1);
        let consumer = consumer(&broker, config(0, 0, 0.0));
        assert_eq!(consumer.state(), ConsumerState::Created);
        assert_eq!(consumer.run().await.unwrap_err().kind(), "InvalidState");

        consumer.connect().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Connected);
        assert_eq!(consumer.connect().await.unwrap_err().kind(), "InvalidState");

        consumer.stop().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(consumer.run().await.unwrap_err().kind(), "InvalidState");
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_message_is_redelivered_before_later_ones() {
        let broker = MemoryBroker::new(1);
        let observer = Arc::new(RecordingObserver::default());
        let consumer = Arc::new(
            consumer(&broker, config(0, 0, 0.0)).with_observer(observer.clone()),
        );
        broker.append("canary", 0, Bytes::from_static(b"{}"));
        broker.append("canary", 0, Bytes::from_static(b"[1]"));
        broker.append("canary", 0, Bytes::from_static(b"{}"));

        consumer.connect().await.unwrap();
        let running = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Offset 1 never parses, so nothing past it is committed
        assert_eq!(broker.committed_offset("canary-group", "canary", 0), Some(1));
        let samples = observer.samples.lock().unwrap().clone();
        assert!(samples.len() > 1);
        assert!(samples.iter().all(|s| s.lag == 2));

        consumer.stop().await.unwrap();
        running.await.unwrap().unwrap();
        consumer.stop().await.unwrap();
        assert_eq!(*observer.shutdowns.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consumes_and_commits_everything() {
        let broker = MemoryBroker::new(3);
        let sender = broker.sender();
        sender.connect().await.unwrap();
        let batch = build_batch(9, PayloadShape::Dated).unwrap();
        sender.send("canary", &batch).await.unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let consumer = Arc::new(
            consumer(&broker, config(0, 1, 0.0)).with_observer(observer.clone()),
        );
        consumer.connect().await.unwrap();
        let running = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        consumer.stop().await.unwrap();
        running.await.unwrap().unwrap();

        for partition in 0..3 {
            assert_eq!(
                broker.committed_offset("canary-group", "canary", partition),
                Some(3)
            );
        }
        let samples = observer.samples.lock().unwrap().clone();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.lag == 0));
    }
}
