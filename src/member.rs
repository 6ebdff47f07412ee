//! Consumer group members.
//!
//! A `ConsumerMember` is a lock listener which runs a partition reader for every partition it
//! holds a lease on. A release is only acknowledged once the partition's reader has stopped and
//! committed its cursor, so the next holder always resumes from where this member stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, Mutex};

use crate::config::Config;
use crate::lock::LockListener;
use crate::models::{Batch, LockState, PartitionId};
use crate::reader::{BatchConsumer, PartitionReader, ReaderConfig};
use crate::storage::{BatchReader, CursorStore};

/// A consumer group member driving partition readers from lease transitions.
#[derive(Clone)]
pub struct ConsumerMember {
    inner: Arc<ConsumerMemberInner>,
}

struct ConsumerMemberInner {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The name of this member, used for logging.
    name: String,
    /// The consumer group of this member.
    group: Arc<String>,
    reader: Arc<dyn BatchReader>,
    cursors: Arc<dyn CursorStore>,
    consumer: Arc<dyn BatchConsumer>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// The readers of all partitions currently leased by this member.
    readers: Mutex<HashMap<PartitionId, Arc<PartitionReader>>>,
}

impl ConsumerMember {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, name: String, group: Arc<String>, reader: Arc<dyn BatchReader>, cursors: Arc<dyn CursorStore>, consumer: Arc<dyn BatchConsumer>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerMemberInner {
                config,
                name,
                group,
                reader,
                cursors,
                consumer,
                shutdown_tx,
                readers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The partitions this member is currently reading.
    pub async fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.inner.readers.lock().await.keys().copied().collect();
        partitions.sort();
        partitions
    }

    /// Stop all of this member's readers.
    ///
    /// Used on shutdown for any reader which its lock group has not already released.
    pub async fn stop_all(&self) -> Result<()> {
        let partitions: Vec<PartitionId> = self.inner.readers.lock().await.keys().copied().collect();
        for partition in partitions {
            self.release(partition)
                .await
                .with_context(|| format!("error stopping reader of partition {}", partition))?;
        }
        Ok(())
    }

    /// Start reading the given partition.
    async fn lock(&self, partition: PartitionId) -> Result<()> {
        let reader = {
            let mut readers = self.inner.readers.lock().await;
            readers
                .entry(partition)
                .or_insert_with(|| {
                    Arc::new(PartitionReader::new(
                        ReaderConfig::new(&self.inner.config, self.inner.group.clone(), partition),
                        self.inner.reader.clone(),
                        self.inner.cursors.clone(),
                        self.inner.consumer.clone(),
                        self.inner.shutdown_tx.clone(),
                    ))
                })
                .clone()
        };
        reader.start().await
    }

    /// Stop reading the given partition, returning once its final cursor is committed.
    ///
    /// The reader stays registered until its stop has completed, so a release which is
    /// abandoned part way is finished by the next one.
    async fn release(&self, partition: PartitionId) -> Result<()> {
        let reader = match self.inner.readers.lock().await.get(&partition).cloned() {
            Some(reader) => reader,
            None => return Ok(()),
        };
        reader.stop().await?;
        let mut readers = self.inner.readers.lock().await;
        if readers.get(&partition).map(|current| Arc::ptr_eq(current, &reader)).unwrap_or(false) {
            readers.remove(&partition);
        }
        Ok(())
    }
}

impl LockListener for ConsumerMember {
    fn on_lock_state(&self, partition: PartitionId, state: LockState, timeout: Duration) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            tracing::debug!(member = %this.inner.name, group = %this.inner.group, %partition, %state, ?timeout, "lease transition received");
            match state {
                LockState::Locked => this.lock(partition).await,
                LockState::Releasing => this.release(partition).await,
            }
        })
    }
}

/// A batch consumer which logs every batch it receives.
pub struct LoggingConsumer {
    /// The name of the member this consumer belongs to.
    pub member: String,
}

impl BatchConsumer for LoggingConsumer {
    fn on_batch<'a>(&'a self, partition: PartitionId, batch: &'a Batch) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tracing::info!(
                member = %self.member,
                %partition,
                start_offset = batch.start_offset(),
                next_offset = batch.next_offset(),
                size = batch.size(),
                "batch consumed"
            );
            Ok(())
        })
    }
}
