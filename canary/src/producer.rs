//! Randomized canary producer
//!
//! This module contains the `Producer`, which sends a batch of a random size
//! to one topic on a fixed cadence until stopped. Send failures are handed to
//! an external error handler; only a failure of that handler stops the loop.

use crate::broker::{DeliveryReceipt, MessageSender};
use crate::error::{CanaryError, Result};
use crate::message::{build_batch, PayloadShape};
use crate::reporting::ErrorReporter;
use crate::utils::{delay, random_between};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Producer behavior, fixed for the producer's lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    pub topic: String,
    /// Minimum time between the starts of consecutive batches
    pub send_interval_ms: u64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub payload_shape: PayloadShape,
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(CanaryError::Config("producer.topic must not be empty".into()));
        }
        if self.min_batch_size == 0 {
            return Err(CanaryError::Config(
                "producer.minMessages must be at least 1".into(),
            ));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(CanaryError::Config(format!(
                "producer.minMessages ({}) exceeds producer.maxMessages ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        Ok(())
    }
}

/// Whether the send loop may keep issuing sends
///
/// The flag is only cleared under the send gate, and every send is issued
/// while holding the gate after re-checking the flag. Once [`halt`] returns,
/// no new send can start.
///
/// [`halt`]: ProducerRunState::halt
#[derive(Default)]
pub struct ProducerRunState {
    running: AtomicBool,
    send_gate: Mutex<()>,
}

impl ProducerRunState {
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clears the flag, waiting for an in-flight send to finish first
    pub async fn halt(&self) {
        let _gate = self.send_gate.lock().await;
        self.running.store(false, Ordering::SeqCst);
    }

    /// Permission to issue one send, or `None` once halted
    async fn begin_send(&self) -> Option<MutexGuard<'_, ()>> {
        let gate = self.send_gate.lock().await;
        self.is_running().then_some(gate)
    }
}

pub struct Producer {
    sender: Arc<dyn MessageSender>,
    config: ProducerConfig,
    reporter: Arc<dyn ErrorReporter>,
    state: ProducerRunState,
}

impl Producer {
    /// Creates a producer over `sender`
    ///
    /// # Returns
    /// * `Err(CanaryError::Config)` - If the batch bounds or topic are invalid
    pub fn new(
        sender: Arc<dyn MessageSender>,
        config: ProducerConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sender,
            config,
            reporter,
            state: ProducerRunState::default(),
        })
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub async fn connect(&self) -> Result<()> {
        self.sender.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.sender.disconnect().await
    }

    /// Starts the send loop on its own task and returns immediately
    ///
    /// Each iteration sends a batch of `[min_batch_size, max_batch_size]`
    /// messages while waiting out `send_interval_ms`, so batches start at
    /// most once per interval. Send failures go to `on_error`; if it fails,
    /// the producer reports that failure and stops itself.
    ///
    /// Calling `run` again while a loop is active starts a second,
    /// independent loop; both end on [`stop`](Producer::stop).
    ///
    /// # Arguments
    /// * `on_error` - Handler awaited for every failed send
    pub fn run<F, Fut>(self: &Arc<Self>, on_error: F) -> JoinHandle<()>
    where
        F: Fn(CanaryError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.state.start();
        let producer = Arc::clone(self);
        tokio::spawn(async move { producer.send_loop(on_error).await })
    }

    async fn send_loop<F, Fut>(&self, on_error: F)
    where
        F: Fn(CanaryError) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        while self.state.is_running() {
            let batch_size = random_between(
                self.config.min_batch_size as u64,
                self.config.max_batch_size as u64,
            ) as usize;
            debug!(topic = %self.config.topic, batch_size, "Producing messages");

            let (sent, ()) = tokio::join!(
                self.send_batch(batch_size),
                delay(self.config.send_interval_ms)
            );

            match sent {
                Ok(Some(receipts)) => {
                    debug!(
                        topic = %self.config.topic,
                        batch_size,
                        partitions = ?partitions_of(&receipts),
                        "Produced messages"
                    );
                }
                // Halted between the loop check and the send
                Ok(None) => break,
                Err(send_error) => {
                    let original = send_error.to_string();
                    if let Err(handler_error) = on_error(send_error).await {
                        error!(
                            error = %original,
                            handler_error = %handler_error,
                            "Error in crash handler. Stopping producer"
                        );
                        self.reporter.capture(&CanaryError::Handler {
                            source: Box::new(handler_error),
                            original,
                        });
                        if let Err(e) = self.stop().await {
                            error!(error = %e, "Failed to stop producer");
                        }
                    }
                }
            }
        }
    }

    async fn send_batch(&self, batch_size: usize) -> Result<Option<Vec<DeliveryReceipt>>> {
        let messages = build_batch(batch_size, self.config.payload_shape)?;
        let Some(_gate) = self.state.begin_send().await else {
            return Ok(None);
        };
        self.sender
            .send(&self.config.topic, &messages)
            .await
            .map(Some)
    }

    /// Ends every send loop and disconnects
    ///
    /// Waits for an in-flight send to settle; after this returns no further
    /// send is issued.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping producer");
        self.state.halt().await;
        self.disconnect().await
    }
}

fn partitions_of(receipts: &[DeliveryReceipt]) -> Vec<i32> {
    let mut partitions: Vec<i32> = receipts.iter().map(|r| r.partition).collect();
    partitions.sort_unstable();
    partitions.dedup();
    partitions
}
