//! Workload coordinator
//!
//! Owns one producer and one consumer and gives them a shared lifecycle:
//! both connect before anything runs, and stopping always attempts both.

use crate::consumer::Consumer;
use crate::error::Result;
use crate::producer::Producer;
use crate::reporting::ErrorReporter;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long `stop` waits for the producer loop to wind down
const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Workload {
    producer: Arc<Producer>,
    consumer: Arc<Consumer>,
    reporter: Arc<dyn ErrorReporter>,
    started: watch::Sender<bool>,
    producer_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Workload {
    pub fn new(
        producer: Arc<Producer>,
        consumer: Arc<Consumer>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            producer,
            consumer,
            reporter,
            started: watch::channel(false).0,
            producer_loop: Mutex::new(None),
        }
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    /// Connects both sides, launches the producer and runs the consumer
    ///
    /// Resolves only when the consumer's subscription ends. If either side
    /// fails to connect, everything is stopped and the connect error is
    /// returned.
    pub async fn start(&self) -> Result<()> {
        info!("Starting workload");
        let (producer, consumer) = tokio::join!(self.producer.connect(), self.consumer.connect());
        if let Err(e) = producer.and(consumer) {
            error!(error = %e, "Failed to connect workload");
            if let Err(stop_error) = self.stop().await {
                warn!(error = %stop_error, "Cleanup after failed start also failed");
            }
            return Err(e);
        }

        let reporter = Arc::clone(&self.reporter);
        let handle = self.producer.run(move |error| {
            let reporter = Arc::clone(&reporter);
            async move {
                error!(kind = error.kind(), error = %error, "Producer encountered error");
                reporter.capture(&error);
                Ok(())
            }
        });
        if let Ok(mut slot) = self.producer_loop.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }

        self.started.send_replace(true);
        info!("Workload started");
        self.consumer.run().await
    }

    /// Resolves once `start` has connected both sides and launched the producer
    pub async fn started(&self) {
        let mut started = self.started.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = started.wait_for(|started| *started).await;
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    /// Stops producer and consumer concurrently
    ///
    /// Both stops are always attempted; the first failure is returned once
    /// both have finished.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping workload");
        let (producer, consumer) = tokio::join!(self.producer.stop(), self.consumer.stop());

        let handle = self.producer_loop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            match tokio::time::timeout(PRODUCER_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Producer loop panicked"),
                Err(_) => warn!(
                    timeout_secs = PRODUCER_JOIN_TIMEOUT.as_secs(),
                    "Producer loop did not finish in time"
                ),
            }
        }

        if let Err(e) = &producer {
            error!(error = %e, "Failed to stop producer");
        }
        if let Err(e) = &consumer {
            error!(error = %e, "Failed to stop consumer");
        }
        producer.and(consumer)
    }
}
