//! Test fixtures.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use rand::prelude::*;
use tokio::sync::{mpsc, watch, Mutex};

use crate::lock::LockListener;
use crate::models::{Batch, LockState, PartitionId};
use crate::reader::BatchConsumer;
use crate::storage::{BatchReader, PartitionSource, TopicStore};

/// Setup some message data in the given partition, returning the last written offset.
pub async fn setup_partition_data(store: &TopicStore, partition: PartitionId) -> Result<u64> {
    let count = rand::thread_rng().gen_range(50..100);
    publish_count(store, partition, count).await
}

/// Publish exactly `count` messages to the given partition, returning the last written offset.
pub async fn publish_count(store: &TopicStore, partition: PartitionId, count: u64) -> Result<u64> {
    let payloads = (0..count).map(|idx| format!("message-{}", idx).into_bytes()).collect();
    store.publish(partition, payloads).await.context("error publishing test data")
}

/// A static partition source whose partition set can be changed by tests.
pub struct StaticPartitions {
    tx: watch::Sender<BTreeSet<PartitionId>>,
    rx: watch::Receiver<BTreeSet<PartitionId>>,
}

impl StaticPartitions {
    pub fn new(count: u32) -> Arc<Self> {
        let (tx, rx) = watch::channel((0..count).map(PartitionId).collect());
        Arc::new(Self { tx, rx })
    }

    /// Add a new partition to the set, signalling its discovery.
    pub fn add(&self, id: PartitionId) {
        let mut set = self.rx.borrow().clone();
        set.insert(id);
        let _res = self.tx.send(set);
    }
}

impl PartitionSource for StaticPartitions {
    fn current_partitions(&self) -> BTreeSet<PartitionId> {
        self.rx.borrow().clone()
    }

    fn watch_partitions(&self) -> watch::Receiver<BTreeSet<PartitionId>> {
        self.rx.clone()
    }
}

/// A lock listener which records every notification it receives and acknowledges according to
/// its configured behavior.
pub struct RecordingListener {
    /// The name of this listener, used only for test output.
    pub name: &'static str,
    /// A channel of all notifications received, in the order received.
    events: mpsc::UnboundedSender<(&'static str, PartitionId, LockState)>,
    /// The behavior of this listener's acknowledgements.
    behavior: Arc<Mutex<AckBehavior>>,
}

/// The acknowledgement behavior of a `RecordingListener`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckBehavior {
    /// Acknowledge every notification immediately.
    Immediate,
    /// Acknowledge after the given delay.
    Delayed(Duration),
    /// Fail every acknowledgement.
    Fail,
    /// Never settle any acknowledgement.
    Hang,
}

impl RecordingListener {
    pub fn new(name: &'static str, events: mpsc::UnboundedSender<(&'static str, PartitionId, LockState)>, behavior: AckBehavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            events,
            behavior: Arc::new(Mutex::new(behavior)),
        })
    }

    /// Update the acknowledgement behavior of this listener.
    pub async fn set_behavior(&self, behavior: AckBehavior) {
        *self.behavior.lock().await = behavior;
    }
}

impl LockListener for RecordingListener {
    fn on_lock_state(&self, partition: PartitionId, state: LockState, _timeout: Duration) -> BoxFuture<'static, Result<()>> {
        let _res = self.events.send((self.name, partition, state));
        let behavior = self.behavior.clone();
        Box::pin(async move {
            let behavior = *behavior.lock().await;
            match behavior {
                AckBehavior::Immediate => Ok(()),
                AckBehavior::Delayed(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                AckBehavior::Fail => bail!("test listener configured to fail"),
                AckBehavior::Hang => futures::future::pending().await,
            }
        })
    }
}

/// A batch consumer which records every offset it sees.
#[derive(Default)]
pub struct RecordingConsumer {
    pub offsets: Mutex<Vec<u64>>,
    /// When set, batches containing this offset are rejected.
    pub reject_offset: Mutex<Option<u64>>,
    /// When set, every batch takes this long to be consumed.
    pub delay: Mutex<Option<Duration>>,
    /// The number of batches currently being consumed.
    pub in_flight: Mutex<usize>,
}

impl RecordingConsumer {
    /// Build a consumer which takes the given time to consume each batch.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Mutex::new(Some(delay)),
            ..Default::default()
        }
    }

    async fn consume(&self, batch: &Batch) -> Result<()> {
        if let Some(delay) = *self.delay.lock().await {
            tokio::time::sleep(delay).await;
        }
        if let Some(reject) = *self.reject_offset.lock().await {
            if batch.iter().any(|msg| msg.offset == reject) {
                bail!("test consumer configured to reject offset {}", reject);
            }
        }
        self.offsets.lock().await.extend(batch.iter().map(|msg| msg.offset));
        Ok(())
    }
}

impl BatchConsumer for RecordingConsumer {
    fn on_batch<'a>(&'a self, _partition: PartitionId, batch: &'a Batch) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            *self.in_flight.lock().await += 1;
            let res = self.consume(batch).await;
            *self.in_flight.lock().await -= 1;
            res
        })
    }
}

/// A batch reader which fails a configured number of reads before delegating.
pub struct FlakyReader<R> {
    pub inner: Arc<R>,
    pub failures_remaining: Arc<Mutex<u32>>,
}

impl<R: BatchReader> BatchReader for FlakyReader<R> {
    fn read(&self, partition: PartitionId, from_offset: u64, max_messages: u32) -> BoxFuture<'static, Result<Batch>> {
        let (inner, failures) = (self.inner.clone(), self.failures_remaining.clone());
        Box::pin(async move {
            {
                let mut failures = failures.lock().await;
                if *failures > 0 {
                    *failures -= 1;
                    bail!("injected transient read failure");
                }
            }
            inner.read(partition, from_offset, max_messages).await
        })
    }
}

/// Wait until the given condition holds, polling every few milliseconds, else time out.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timeout waiting for condition after {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
