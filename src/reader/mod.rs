//! Partition readers.
//!
//! A `PartitionReader` consumes a single partition on behalf of a consumer group, from the
//! group's committed cursor onwards. Each batch read is handed to a `BatchConsumer`, and the
//! cursor is advanced and committed only once the consumer has accepted the batch, which gives
//! at-least-once delivery.


use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::error::ShutdownError;
use crate::models::{Batch, PartitionId};
use crate::storage::{BatchReader, CursorStore};

const METRIC_READER_BATCHES: &str = "hadron_lease_reader_batches";
const METRIC_READER_READ_ERRORS: &str = "hadron_lease_reader_read_errors";

/// A consumer of the batches read by a partition reader.
pub trait BatchConsumer: Send + Sync + 'static {
    /// Process a batch read from the given partition.
    ///
    /// An error causes the same batch to be delivered again after a backoff.
    fn on_batch<'a>(&'a self, partition: PartitionId, batch: &'a Batch) -> BoxFuture<'a, Result<()>>;
}

/// The config of a single partition reader.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// The consumer group on whose behalf the partition is read.
    pub group: Arc<String>,
    /// The partition to read.
    pub partition: PartitionId,
    /// The max number of messages per batch.
    pub max_messages: u32,
    /// The time to wait before reading again when the partition has no new data.
    pub idle: Duration,
    /// The time to wait before trying again after a failure.
    pub retry: Duration,
}

impl ReaderConfig {
    /// Build a reader config for the given group & partition from the runtime config.
    pub fn new(config: &Config, group: Arc<String>, partition: PartitionId) -> Self {
        Self {
            group,
            partition,
            max_messages: config.max_batch_size,
            idle: config.reader_idle(),
            retry: config.reader_retry(),
        }
    }
}

/// A restartable reader of a single partition.
///
/// `start` and `stop` are idempotent and serialized: a `start` issued while a `stop` is in
/// progress waits for the stop to finish and then starts fresh.
pub struct PartitionReader {
    config: ReaderConfig,
    reader: Arc<dyn BatchReader>,
    cursors: Arc<dyn CursorStore>,
    consumer: Arc<dyn BatchConsumer>,
    shutdown_tx: broadcast::Sender<()>,

    /// The currently running read loop, if any.
    task: Mutex<Option<ReaderTask>>,
    /// The in-memory cursor, `None` until the reader has first started.
    offset: Arc<RwLock<Option<u64>>>,
}

/// A handle to a running read loop.
struct ReaderTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl PartitionReader {
    /// Create a new instance.
    pub fn new(
        config: ReaderConfig, reader: Arc<dyn BatchReader>, cursors: Arc<dyn CursorStore>, consumer: Arc<dyn BatchConsumer>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        metrics::register_counter!(METRIC_READER_BATCHES, metrics::Unit::Count, "batches delivered to consumers by partition readers");
        metrics::register_counter!(METRIC_READER_READ_ERRORS, metrics::Unit::Count, "partition read errors observed by partition readers");
        Self {
            config,
            reader,
            cursors,
            consumer,
            shutdown_tx,
            task: Mutex::new(None),
            offset: Arc::new(RwLock::new(None)),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.config.partition
    }

    /// Start reading the partition, a no-op if already running.
    ///
    /// Resumes from where the previous run of this reader left off, else from the group's
    /// committed cursor.
    #[tracing::instrument(level = "trace", skip(self), fields(group = %self.config.group, partition = %self.config.partition))]
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        let is_live = task
            .as_ref()
            .map(|running| !running.handle.is_finished() && !*running.stop_tx.borrow());
        if is_live == Some(true) {
            return Ok(());
        }
        // The loop may have exited on its own due to shutdown, or be finishing an interrupted
        // stop. Reap it before starting again.
        if let Err(err) = join_task(&mut task).await {
            tracing::error!(error = ?err, "partition reader exited with error");
        }

        let cached = *self.offset.read().await;
        let offset = match cached {
            Some(offset) => offset,
            None => self
                .cursors
                .get_cursor(self.config.partition, &self.config.group)
                .await
                .context("error fetching partition cursor")?,
        };
        *self.offset.write().await = Some(offset);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ReadLoop {
            config: self.config.clone(),
            reader: self.reader.clone(),
            cursors: self.cursors.clone(),
            consumer: self.consumer.clone(),
            shared_offset: self.offset.clone(),
            offset,
            committed: offset,
            stop_rx,
            shutdown_tx: self.shutdown_tx.clone(),
            shutdown_rx: BroadcastStream::new(self.shutdown_tx.subscribe()),
        }
        .spawn();
        *task = Some(ReaderTask { stop_tx, handle });
        tracing::debug!(offset, "partition reader started");
        Ok(())
    }

    /// Stop reading the partition, waiting for the read loop to finish its last commit.
    ///
    /// A no-op if not running. If this future is dropped before the loop has exited, the loop
    /// remains tracked and the next call to `stop` waits for it.
    #[tracing::instrument(level = "trace", skip(self), fields(group = %self.config.group, partition = %self.config.partition))]
    pub async fn stop(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_none() {
            return Ok(());
        }
        join_task(&mut task).await?;
        tracing::debug!("partition reader stopped");
        Ok(())
    }

    /// Check if the read loop is currently running.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// The in-memory cursor of this reader: the next offset to be read.
    pub async fn offset(&self) -> Option<u64> {
        *self.offset.read().await
    }
}

/// Signal the given read loop to stop and wait for it to exit.
///
/// The task is only cleared once it has been joined.
async fn join_task(task: &mut Option<ReaderTask>) -> Result<()> {
    let running = match task.as_mut() {
        Some(running) => running,
        None => return Ok(()),
    };
    let _res = running.stop_tx.send(true);
    let res = (&mut running.handle).await;
    *task = None;
    res.context("error joining partition reader")?
}

/// The read loop of a running partition reader.
struct ReadLoop {
    config: ReaderConfig,
    reader: Arc<dyn BatchReader>,
    cursors: Arc<dyn CursorStore>,
    consumer: Arc<dyn BatchConsumer>,
    shared_offset: Arc<RwLock<Option<u64>>>,

    /// The next offset to read.
    offset: u64,
    /// The last offset durably committed.
    committed: u64,

    /// A signal to stop the loop.
    stop_rx: watch::Receiver<bool>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ReadLoop {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            self.commit().await;

            let read = tokio::select! {
                res = self.reader.read(self.config.partition, self.offset, self.config.max_messages) => res,
                _ = self.stop_rx.changed() => break,
                _ = self.shutdown_rx.next() => break,
            };
            let batch = match read {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(error = ?err, group = %self.config.group, partition = %self.config.partition, "error reading partition");
                    metrics::increment_counter!(METRIC_READER_READ_ERRORS);
                    if self.wait(self.config.retry).await {
                        break;
                    }
                    continue;
                }
            };
            if batch.is_empty() {
                if self.wait(self.config.idle).await {
                    break;
                }
                continue;
            }

            if let Err(err) = self.consumer.on_batch(self.config.partition, &batch).await {
                tracing::warn!(
                    error = ?err, group = %self.config.group, partition = %self.config.partition, offset = batch.start_offset(),
                    "consumer rejected batch, will redeliver"
                );
                if self.wait(self.config.retry).await {
                    break;
                }
                continue;
            }
            metrics::increment_counter!(METRIC_READER_BATCHES);
            self.offset = batch.next_offset();
            *self.shared_offset.write().await = Some(self.offset);
            self.commit().await;
        }

        // Commit anything still outstanding before exiting.
        self.commit().await;
        if self.committed != self.offset {
            tracing::error!(group = %self.config.group, partition = %self.config.partition, offset = self.offset, "partition reader exiting with uncommitted cursor");
        }
        Ok(())
    }

    /// Commit the in-memory cursor if it is ahead of the committed cursor.
    async fn commit(&mut self) {
        if self.committed == self.offset {
            return;
        }
        match self.cursors.set_cursor(self.config.partition, &self.config.group, self.offset).await {
            Ok(()) => self.committed = self.offset,
            Err(err) => {
                tracing::error!(error = ?err, group = %self.config.group, partition = %self.config.partition, "error committing partition cursor");
                if err.downcast_ref::<ShutdownError>().is_some() {
                    let _ = self.shutdown_tx.send(());
                }
            }
        }
    }

    /// Wait for the given duration, returning `true` if interrupted by a stop or shutdown.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.stop_rx.changed() => true,
            _ = self.shutdown_rx.next() => true,
        }
    }
}
