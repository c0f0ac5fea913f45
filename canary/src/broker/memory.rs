//! In-process broker
//!
//! Topics are created on first use with a fixed partition count. Producers
//! spread messages round-robin over partitions; each consumer group keeps its
//! own committed offsets. A group has a single member, which is assigned every
//! partition of the subscribed topic.
//!
//! Used by `--in-memory` runs and by tests, which can also take the broker
//! offline or make sends fail.

use super::{DeliveryReceipt, MessageSender, MessageSource, PartitionBatch};
use crate::error::{CanaryError, Result};
use crate::message::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Upper bound on messages returned per partition per poll
const MAX_PARTITION_FETCH: usize = 64;
/// Poll wake-up interval while no new messages arrive
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<Bytes>>>,
    /// (group, topic, partition) -> next offset to consume
    committed: HashMap<(String, String, i32), i64>,
    next_partition: usize,
    send_calls: usize,
    failing_sends: usize,
    /// Size of every successful send, in order
    batch_sizes: Vec<usize>,
}

pub struct MemoryBroker {
    partitions: i32,
    state: Mutex<BrokerState>,
    online: AtomicBool,
    appended: Notify,
}

impl MemoryBroker {
    pub fn new(partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            partitions: partitions.max(1),
            state: Mutex::new(BrokerState::default()),
            online: AtomicBool::new(true),
            appended: Notify::new(),
        })
    }

    pub fn sender(self: &Arc<Self>) -> MemorySender {
        MemorySender {
            broker: Arc::clone(self),
            connected: AtomicBool::new(false),
        }
    }

    pub fn source(self: &Arc<Self>, group_id: &str) -> MemorySource {
        MemorySource {
            broker: Arc::clone(self),
            group_id: group_id.to_string(),
            connected: AtomicBool::new(false),
            subscription: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// While offline, connects fail with a connection error
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Makes the next `count` sends fail
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().failing_sends = count;
    }

    /// Number of send calls that reached the broker, failed ones included
    pub fn send_calls(&self) -> usize {
        self.lock().send_calls
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Messages stored for `topic` across all partitions
    pub fn message_count(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Appends a raw payload to one partition, bypassing the producer
    pub fn append(&self, topic: &str, partition: i32, payload: Bytes) -> i64 {
        let offset = {
            let mut state = self.lock();
            let log = self.partition_log(&mut state, topic, partition);
            log.push(payload);
            log.len() as i64 - 1
        };
        self.appended.notify_waiters();
        offset
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves the state usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn partition_log<'a>(&self, state: &'a mut BrokerState, topic: &str, partition: i32) -> &'a mut Vec<Bytes> {
        let partitions = self.partitions as usize;
        let logs = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        let index = (partition.max(0) as usize) % partitions;
        &mut logs[index]
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CanaryError::Connection("in-memory broker is offline".into()))
        }
    }
}

pub struct MemorySender {
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn connect(&self) -> Result<()> {
        self.broker.check_online()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, topic: &str, messages: &[OutboundMessage]) -> Result<Vec<DeliveryReceipt>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CanaryError::Connection("producer is not connected".into()));
        }
        let receipts = {
            let mut state = self.broker.lock();
            state.send_calls += 1;
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(CanaryError::Send("injected send failure".into()));
            }
            state.batch_sizes.push(messages.len());
            let mut receipts = Vec::with_capacity(messages.len());
            for message in messages {
                let partition = (state.next_partition % self.broker.partitions as usize) as i32;
                state.next_partition = state.next_partition.wrapping_add(1);
                let log = self.broker.partition_log(&mut state, topic, partition);
                log.push(message.payload.clone());
                receipts.push(DeliveryReceipt {
                    partition,
                    offset: log.len() as i64 - 1,
                });
            }
            receipts
        };
        self.broker.appended.notify_waiters();
        Ok(receipts)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct Subscription {
    topic: String,
    /// partition -> next offset to fetch
    positions: BTreeMap<i32, i64>,
}

pub struct MemorySource {
    broker: Arc<MemoryBroker>,
    group_id: String,
    connected: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
    closed: CancellationToken,
}

impl MemorySource {
    fn subscription(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Collects everything past the fetch positions and advances them
    fn fetch(&self) -> Option<Vec<PartitionBatch>> {
        let mut subscription = self.subscription();
        let subscription = subscription.as_mut()?;
        let state = self.broker.lock();
        let logs = state.topics.get(&subscription.topic)?;

        let mut batches = Vec::new();
        for (partition, position) in subscription.positions.iter_mut() {
            let log = &logs[*partition as usize];
            let start = (*position).max(0) as usize;
            if start >= log.len() {
                continue;
            }
            let end = (start + MAX_PARTITION_FETCH).min(log.len());
            let messages = (start..end)
                .map(|offset| InboundMessage {
                    topic: subscription.topic.clone(),
                    partition: *partition,
                    offset: offset as i64,
                    raw_payload: log[offset].clone(),
                })
                .collect();
            *position = end as i64;
            batches.push(PartitionBatch {
                topic: subscription.topic.clone(),
                partition: *partition,
                high_watermark: log.len() as i64,
                messages,
            });
        }
        Some(batches).filter(|b| !b.is_empty())
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn connect(&self) -> Result<()> {
        self.broker.check_online()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CanaryError::Connection("consumer is not connected".into()));
        }
        let positions = {
            let mut state = self.broker.lock();
            // Materialize the topic so every partition is assigned
            self.broker.partition_log(&mut state, topic, 0);
            (0..self.broker.partitions)
                .map(|partition| {
                    let key = (self.group_id.clone(), topic.to_string(), partition);
                    let position = match state.committed.get(&key) {
                        Some(committed) => *committed,
                        None if from_beginning => 0,
                        None => state.topics[topic][partition as usize].len() as i64,
                    };
                    (partition, position)
                })
                .collect()
        };
        *self.subscription() = Some(Subscription {
            topic: topic.to_string(),
            positions,
        });
        info!(topic, group_id = %self.group_id, from_beginning, "Subscribed");
        Ok(())
    }

    async fn poll_batch(&self) -> Result<Option<Vec<PartitionBatch>>> {
        loop {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            // Registered before fetching so an append in between still wakes us
            let appended = self.broker.appended.notified();
            if let Some(batches) = self.fetch() {
                return Ok(Some(batches));
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                _ = appended => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut state = self.broker.lock();
        state
            .committed
            .insert((self.group_id.clone(), topic.to_string(), partition), next_offset);
        debug!(topic, partition, next_offset, "Committed offset");
        Ok(())
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut subscription = self.subscription();
        match subscription.as_mut() {
            Some(s) if s.topic == topic => {
                s.positions.insert(partition, offset);
                Ok(())
            }
            _ => Err(CanaryError::Broker(format!(
                "not subscribed to {}[{}]",
                topic, partition
            ))),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
