//! Metric publishing
//!
//! Code records metrics through the `metrics` facade (`gauge!`, `counter!`,
//! `histogram!`). When metrics are enabled, `main` installs an
//! [`EmfRecorder`] as the global recorder. An [`EmfPublisher`] then drains a
//! snapshot of the recorder's registry into a [`MetricSink`] every send
//! interval and once more on shutdown. Without an installed recorder the
//! facade discards every sample.
//!
//! The production sink writes CloudWatch Embedded Metric Format documents to
//! stdout, where the log agent turns them into metrics.

use crate::error::{CanaryError, Result};
use crate::utils::epoch_millis;
use metrics::{
    describe_gauge, Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString,
    Unit,
};
use metrics_util::registry::{AtomicStorage, Registry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(10);

/// Lag of the consumer group per partition, in messages
pub const OFFSET_LAG: &str = "OffsetLag";

/// Namespace suffix of the consumer metrics
pub const CONSUMER_NAMESPACE: &str = "Consumer";

/// Registers units and descriptions with the current recorder
pub fn describe_metrics() {
    describe_gauge!(
        OFFSET_LAG,
        Unit::Count,
        "Messages between the consumed position and the high watermark"
    );
}

/// Name/value pair attached to a sample
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dimension {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    #[serde(rename = "Value", alias = "value")]
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

/// Later entries win; a name keeps the position of its first appearance
pub fn merge_dimensions(base: &[Dimension], extra: &[Dimension]) -> Vec<Dimension> {
    let mut merged: Vec<Dimension> = base.to_vec();
    for dimension in extra {
        match merged.iter_mut().find(|d| d.name == dimension.name) {
            Some(existing) => existing.value = dimension.value.clone(),
            None => merged.push(dimension.clone()),
        }
    }
    merged
}

/// CloudWatch unit name
pub fn emf_unit(unit: Option<Unit>) -> &'static str {
    match unit {
        Some(Unit::Count) => "Count",
        Some(Unit::Percent) => "Percent",
        Some(Unit::Seconds) => "Seconds",
        Some(Unit::Milliseconds) => "Milliseconds",
        Some(Unit::Microseconds) => "Microseconds",
        Some(Unit::Bytes) => "Bytes",
        Some(Unit::CountPerSecond) => "Count/Second",
        _ => "None",
    }
}

/// Publish options shared by every metric
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricOptions {
    /// Publish interval in milliseconds
    pub send_interval: Option<u64>,
}

impl MetricOptions {
    pub fn send_interval(&self) -> Duration {
        self.send_interval
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SEND_INTERVAL)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Recorded in logs only; EMF documents are routed by the log agent
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub default_dimensions: Vec<Dimension>,
    #[serde(default)]
    pub default_metric_options: MetricOptions,
}

fn default_namespace() -> String {
    crate::SERVICE_NAME.to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            region: String::new(),
            namespace: default_namespace(),
            default_dimensions: Vec::new(),
            default_metric_options: MetricOptions::default(),
        }
    }
}

impl MetricsSettings {
    /// Full namespace of a metric family, e.g. `kafka-canary/Consumer`
    pub fn namespace_for(&self, family: &str) -> String {
        format!("{}/{}", self.namespace, family)
    }
}

/// One series as seen by a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub unit: Option<Unit>,
    pub dimensions: Vec<Dimension>,
    /// Gauges and counters carry their current value, histograms every
    /// value recorded since the previous snapshot
    pub values: Vec<f64>,
}

/// Destination for published samples
pub trait MetricSink: Send + Sync {
    fn record(
        &self,
        namespace: &str,
        name: &str,
        value: f64,
        unit: Option<Unit>,
        dimensions: &[Dimension],
    ) -> Result<()>;

    /// Publishes several samples of one series at once
    fn record_many(
        &self,
        namespace: &str,
        name: &str,
        values: &[f64],
        unit: Option<Unit>,
        dimensions: &[Dimension],
    ) -> Result<()> {
        for value in values {
            self.record(namespace, name, *value, unit, dimensions)?;
        }
        Ok(())
    }
}

/// Writes one CloudWatch Embedded Metric Format document per series
pub struct EmfSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl EmfSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn document(
        namespace: &str,
        name: &str,
        values: &[f64],
        unit: Option<Unit>,
        dimensions: &[Dimension],
    ) -> serde_json::Value {
        let dimension_names: Vec<&str> = dimensions.iter().map(|d| d.name.as_str()).collect();
        let mut document = serde_json::json!({
            "_aws": {
                "Timestamp": epoch_millis(),
                "CloudWatchMetrics": [{
                    "Namespace": namespace,
                    "Dimensions": [dimension_names],
                    "Metrics": [{ "Name": name, "Unit": emf_unit(unit) }],
                }],
            },
        });
        if let Some(fields) = document.as_object_mut() {
            for dimension in dimensions {
                fields.insert(dimension.name.clone(), dimension.value.clone().into());
            }
            let value = match values {
                [single] => serde_json::json!(single),
                many => serde_json::json!(many),
            };
            fields.insert(name.to_string(), value);
        }
        document
    }
}

impl MetricSink for EmfSink {
    fn record(
        &self,
        namespace: &str,
        name: &str,
        value: f64,
        unit: Option<Unit>,
        dimensions: &[Dimension],
    ) -> Result<()> {
        self.record_many(namespace, name, &[value], unit, dimensions)
    }

    fn record_many(
        &self,
        namespace: &str,
        name: &str,
        values: &[f64],
        unit: Option<Unit>,
        dimensions: &[Dimension],
    ) -> Result<()> {
        let line = serde_json::to_string(&Self::document(namespace, name, values, unit, dimensions))
            .map_err(|e| CanaryError::Metrics(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| CanaryError::Metrics("metric output lock poisoned".into()))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

struct RecorderState {
    registry: Registry<Key, AtomicStorage>,
    units: Mutex<HashMap<String, Unit>>,
}

impl RecorderState {
    fn describe(&self, key: KeyName, unit: Option<Unit>) {
        if let (Some(unit), Ok(mut units)) = (unit, self.units.lock()) {
            units.insert(key.as_str().to_string(), unit);
        }
    }
}

/// `metrics` recorder keeping the latest state of every series in memory
pub struct EmfRecorder {
    state: Arc<RecorderState>,
}

impl Default for EmfRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmfRecorder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RecorderState {
                registry: Registry::atomic(),
                units: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn handle(&self) -> MetricsHandle {
        MetricsHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Installs the recorder process-wide and registers the metric descriptions
    pub fn install(self) -> Result<MetricsHandle> {
        let handle = self.handle();
        metrics::set_global_recorder(self)
            .map_err(|_| CanaryError::Metrics("a metrics recorder is already installed".into()))?;
        describe_metrics();
        Ok(handle)
    }
}

impl Recorder for EmfRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, _description: SharedString) {
        self.state.describe(key, unit);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, _description: SharedString) {
        self.state.describe(key, unit);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, _description: SharedString) {
        self.state.describe(key, unit);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.state
            .registry
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.state
            .registry
            .get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.state
            .registry
            .get_or_create_histogram(key, |h| h.clone().into())
    }
}

/// Read side of an [`EmfRecorder`]
#[derive(Clone)]
pub struct MetricsHandle {
    state: Arc<RecorderState>,
}

impl MetricsHandle {
    /// Current series, sorted by name and dimensions. Histograms are drained.
    pub fn snapshot(&self) -> Vec<Sample> {
        let units = self
            .state
            .units
            .lock()
            .map(|units| units.clone())
            .unwrap_or_default();
        let sample = |key: &Key, values: Vec<f64>| Sample {
            name: key.name().to_string(),
            unit: units.get(key.name()).copied(),
            dimensions: key
                .labels()
                .map(|label| Dimension::new(label.key(), label.value()))
                .collect(),
            values,
        };

        let mut samples = Vec::new();
        self.state.registry.visit_gauges(|key, gauge| {
            let value = f64::from_bits(gauge.load(Ordering::Acquire));
            samples.push(sample(key, vec![value]));
        });
        self.state.registry.visit_counters(|key, counter| {
            samples.push(sample(key, vec![counter.load(Ordering::Acquire) as f64]));
        });
        self.state.registry.visit_histograms(|key, histogram| {
            let mut values = Vec::new();
            histogram.clear_with(|chunk| values.extend_from_slice(chunk));
            if !values.is_empty() {
                samples.push(sample(key, values));
            }
        });
        samples.sort_by(|a, b| (&a.name, &a.dimensions).cmp(&(&b.name, &b.dimensions)));
        samples
    }
}

/// Callback for publish failures
pub type SendErrorHandler = Arc<dyn Fn(&CanaryError) + Send + Sync>;

fn log_send_error() -> SendErrorHandler {
    Arc::new(|e: &CanaryError| error!(error = %e, "Failed to send metrics"))
}

/// Drains recorder snapshots into a sink on a fixed interval
pub struct EmfPublisher {
    handle: MetricsHandle,
    sink: Arc<dyn MetricSink>,
    namespace: String,
    default_dimensions: Vec<Dimension>,
    send_interval: Duration,
    on_send_error: SendErrorHandler,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

impl EmfPublisher {
    pub fn new(
        settings: &MetricsSettings,
        namespace: String,
        handle: MetricsHandle,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            handle,
            sink,
            namespace,
            default_dimensions: settings.default_dimensions.clone(),
            send_interval: settings.default_metric_options.send_interval(),
            on_send_error: log_send_error(),
            task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_send_error_handler(mut self, handler: SendErrorHandler) -> Self {
        self.on_send_error = handler;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Publishes the current snapshot, returning the number of values sent
    pub fn publish(&self) -> usize {
        let mut published = 0;
        for sample in self.handle.snapshot() {
            let dimensions = merge_dimensions(&self.default_dimensions, &sample.dimensions);
            match self.sink.record_many(
                &self.namespace,
                &sample.name,
                &sample.values,
                sample.unit,
                &dimensions,
            ) {
                Ok(()) => published += sample.values.len(),
                Err(e) => (self.on_send_error)(&e),
            }
        }
        published
    }

    /// Starts periodic publishing. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.is_some() || self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let publisher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(publisher.send_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        publisher.publish();
                    }
                }
            }
        });
        *slot = Some((token, handle));
    }

    /// Stops periodic publishing and publishes once more. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
        }
        let published = self.publish();
        debug!(namespace = %self.namespace, published, "Metrics publisher shut down");
    }
}
