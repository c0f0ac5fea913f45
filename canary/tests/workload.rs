//! End-to-end scenarios against the in-memory broker

use kafka_canary::broker::memory::MemoryBroker;
use kafka_canary::broker::RedeliveryPolicy;
use kafka_canary::consumer::{Consumer, ConsumerConfig, ConsumerState, LagMetricObserver};
use kafka_canary::message::PayloadShape;
use kafka_canary::metrics::{
    Dimension, EmfPublisher, EmfRecorder, MetricSink, MetricsHandle, MetricsSettings,
    CONSUMER_NAMESPACE, OFFSET_LAG,
};
use kafka_canary::producer::{Producer, ProducerConfig};
use kafka_canary::reporting::{ErrorReporter, SentrySettings, TracingReporter};
use kafka_canary::workload::Workload;
use kafka_canary::{CanaryError, Result};
use metrics::Unit;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

const TOPIC: &str = "canary";
const GROUP: &str = "canary-group";

fn producer_config(topic: &str, min: usize, max: usize, interval: u64) -> ProducerConfig {
    ProducerConfig {
        topic: topic.into(),
        send_interval_ms: interval,
        min_batch_size: min,
        max_batch_size: max,
        payload_shape: PayloadShape::Templated,
    }
}

fn consumer_config(topic: &str, error_chance: f64) -> ConsumerConfig {
    ConsumerConfig {
        group_id: GROUP.into(),
        topic: topic.into(),
        min_processing_delay_ms: 0,
        max_processing_delay_ms: 1,
        synthetic_failure_probability: error_chance,
        from_beginning: true,
    }
}

fn reporter() -> Arc<TracingReporter> {
    Arc::new(TracingReporter::new(&SentrySettings {
        enabled: true,
        dsn: None,
    }))
}

/// The recorder is process-wide, so every test shares one
fn recorder() -> &'static MetricsHandle {
    static HANDLE: OnceLock<MetricsHandle> = OnceLock::new();
    HANDLE.get_or_init(|| EmfRecorder::new().install().unwrap())
}

#[derive(Default)]
struct LagSink {
    samples: Mutex<Vec<(String, String, f64, Vec<Dimension>)>>,
}

impl MetricSink for LagSink {
    fn record(
        &self,
        namespace: &str,
        name: &str,
        value: f64,
        _unit: Option<Unit>,
        dimensions: &[Dimension],
    ) -> Result<()> {
        self.samples.lock().unwrap().push((
            namespace.to_string(),
            name.to_string(),
            value,
            dimensions.to_vec(),
        ));
        Ok(())
    }
}

/// Remembers which messages the consumer picked up
#[derive(Default)]
struct OffsetTrail {
    consumed: Mutex<Vec<(i32, i64)>>,
    captured: Mutex<Vec<String>>,
}

impl ErrorReporter for OffsetTrail {
    fn breadcrumb(&self, message: &str, data: serde_json::Value) {
        if message == "Consuming message" {
            let partition = data["partition"].as_i64().unwrap() as i32;
            let offset = data["offset"].as_i64().unwrap();
            self.consumed.lock().unwrap().push((partition, offset));
        }
    }

    fn capture(&self, error: &CanaryError) {
        self.captured.lock().unwrap().push(error.to_string());
    }
}

struct Harness {
    broker: Arc<MemoryBroker>,
    workload: Arc<Workload>,
    reporter: Arc<TracingReporter>,
}

fn harness(producer: ProducerConfig, consumer: ConsumerConfig) -> Harness {
    let broker = MemoryBroker::new(3);
    let reporter = reporter();
    let producer = Producer::new(Arc::new(broker.sender()), producer, reporter.clone()).unwrap();
    let consumer = Consumer::new(Arc::new(broker.source(GROUP)), consumer, reporter.clone())
        .unwrap()
        .with_redelivery(RedeliveryPolicy::immediate())
        .with_observer(Arc::new(LagMetricObserver));
    let workload = Arc::new(Workload::new(
        Arc::new(producer),
        Arc::new(consumer),
        reporter.clone(),
    ));
    Harness {
        broker,
        workload,
        reporter,
    }
}

fn committed_total(broker: &MemoryBroker, topic: &str) -> i64 {
    (0..3)
        .filter_map(|partition| broker.committed_offset(GROUP, topic, partition))
        .sum()
}

async fn run_for(harness: &Harness, duration: Duration) {
    let running = tokio::spawn({
        let workload = harness.workload.clone();
        async move { workload.start().await }
    });
    harness.workload.started().await;
    tokio::time::sleep(duration).await;
    harness.workload.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn single_message_batches_without_interval() {
    let harness = harness(producer_config(TOPIC, 1, 1, 0), consumer_config(TOPIC, 0.0));
    run_for(&harness, Duration::from_millis(100)).await;

    let sizes = harness.broker.batch_sizes();
    assert!(!sizes.is_empty());
    assert!(sizes.iter().all(|size| *size == 1));

    // No send after stop
    let sent = harness.broker.send_calls();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(harness.broker.send_calls(), sent);
    assert!(!harness.workload.producer().is_running());
    assert_eq!(harness.workload.consumer().state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn every_produced_message_is_consumed_exactly_once() {
    const TOPIC: &str = "canary-once";
    let broker = MemoryBroker::new(3);
    let trail = Arc::new(OffsetTrail::default());
    let producer = Producer::new(
        Arc::new(broker.sender()),
        producer_config(TOPIC, 1, 1, 0),
        trail.clone(),
    )
    .unwrap();
    let consumer = Consumer::new(
        Arc::new(broker.source(GROUP)),
        ConsumerConfig {
            max_processing_delay_ms: 0,
            ..consumer_config(TOPIC, 0.0)
        },
        trail.clone(),
    )
    .unwrap();
    let workload = Arc::new(Workload::new(
        Arc::new(producer),
        Arc::new(consumer),
        trail.clone(),
    ));

    let running = tokio::spawn({
        let workload = workload.clone();
        async move { workload.start().await }
    });
    workload.started().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    workload.producer().stop().await.unwrap();

    // Let the consumer catch up with everything that was produced
    let produced = broker.message_count(TOPIC);
    assert!(produced > 0);
    tokio::time::timeout(Duration::from_secs(5), async {
        while committed_total(&broker, TOPIC) < produced as i64 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    workload.stop().await.unwrap();
    running.await.unwrap().unwrap();

    assert!(broker.batch_sizes().iter().all(|size| *size == 1));
    assert_eq!(committed_total(&broker, TOPIC), produced as i64);
    let consumed = trail.consumed.lock().unwrap().clone();
    let distinct: HashSet<(i32, i64)> = consumed.iter().copied().collect();
    assert_eq!(consumed.len(), produced, "consumed {:?}", consumed);
    assert_eq!(distinct.len(), produced);
    // Every payload parsed
    assert!(trail.captured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn consumed_offsets_are_committed_and_lag_published() {
    const TOPIC: &str = "canary-lag";
    let metrics = recorder().clone();
    let harness = harness(producer_config(TOPIC, 1, 5, 10), consumer_config(TOPIC, 0.0));
    run_for(&harness, Duration::from_millis(200)).await;

    let committed = committed_total(&harness.broker, TOPIC);
    assert!(committed > 0);
    assert!(committed as usize <= harness.broker.message_count(TOPIC));

    let settings = MetricsSettings {
        enabled: true,
        ..MetricsSettings::default()
    };
    let sink = Arc::new(LagSink::default());
    let publisher = EmfPublisher::new(
        &settings,
        settings.namespace_for(CONSUMER_NAMESPACE),
        metrics,
        sink.clone(),
    );
    publisher.shutdown().await;

    // Other tests share the recorder; keep this topic's series only
    let samples: Vec<_> = sink
        .samples
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, _, _, dims)| dims.iter().any(|d| d.name == "Topic" && d.value == TOPIC))
        .cloned()
        .collect();
    assert!(!samples.is_empty());
    for (namespace, name, lag, dims) in &samples {
        assert_eq!(namespace, "kafka-canary/Consumer");
        assert_eq!(name, OFFSET_LAG);
        assert!(*lag >= 0.0);
        assert!(dims.iter().any(|d| d.name == "Partition"));
    }
}

#[tokio::test]
async fn certain_failure_commits_nothing() {
    let harness = harness(producer_config(TOPIC, 1, 3, 5), consumer_config(TOPIC, 1.0));
    run_for(&harness, Duration::from_millis(100)).await;

    assert!(harness.broker.message_count(TOPIC) > 0);
    for partition in 0..3 {
        assert_eq!(harness.broker.committed_offset(GROUP, TOPIC, partition), None);
    }
    // Synthetic failures are logged, not reported
    assert_eq!(harness.reporter.captured(), 0);
}

#[tokio::test]
async fn send_failures_are_reported_and_production_continues() {
    let harness = harness(producer_config(TOPIC, 1, 2, 5), consumer_config(TOPIC, 0.0));
    harness.broker.fail_next_sends(3);
    run_for(&harness, Duration::from_millis(120)).await;

    assert_eq!(harness.reporter.captured(), 3);
    assert!(harness.broker.send_calls() > 3);
    assert!(harness.broker.message_count(TOPIC) > 0);
}

#[tokio::test]
async fn start_fails_when_broker_is_unreachable() {
    let harness = harness(producer_config(TOPIC, 1, 1, 0), consumer_config(TOPIC, 0.0));
    harness.broker.set_online(false);

    let err = harness.workload.start().await.unwrap_err();
    assert!(matches!(err, CanaryError::Connection(_)));
    assert!(!harness.workload.is_started());
    assert_eq!(harness.broker.send_calls(), 0);
    assert_eq!(harness.workload.consumer().state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn failing_error_handler_stops_only_the_producer() {
    let broker = MemoryBroker::new(1);
    broker.fail_next_sends(1);
    let reporter = reporter();
    let producer = Arc::new(
        Producer::new(Arc::new(broker.sender()), producer_config(TOPIC, 1, 1, 1), reporter.clone())
            .unwrap(),
    );
    producer.connect().await.unwrap();

    let handle = producer.run(|error| async move {
        Err(CanaryError::Broker(format!("cannot handle {}", error.kind())))
    });
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(!producer.is_running());
    assert_eq!(broker.send_calls(), 1);
    assert_eq!(reporter.captured(), 1);
    // A later stop is still fine
    producer.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_run_starts_a_second_loop() {
    let broker = MemoryBroker::new(1);
    let producer = Arc::new(
        Producer::new(Arc::new(broker.sender()), producer_config(TOPIC, 1, 1, 20), reporter()).unwrap(),
    );
    producer.connect().await.unwrap();

    let first = producer.run(|_| async { Ok(()) });
    let second = producer.run(|_| async { Ok(()) });
    tokio::time::sleep(Duration::from_millis(90)).await;
    producer.stop().await.unwrap();
    first.await.unwrap();
    second.await.unwrap();

    // Two loops at one batch per 20 ms each
    assert!(broker.send_calls() >= 7, "sends = {}", broker.send_calls());
}
