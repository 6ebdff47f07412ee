use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use sled::Tree;
use tokio::sync::{watch, Mutex, RwLock};

use crate::database::Database;
use crate::error::{AppError, ShutdownError, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::{Batch, Message, PartitionId};
use crate::storage::{BatchReader, CursorStore, PartitionSource};
use crate::utils;

/// The metadata key prefix used for the topic's partition registry.
///
/// Entries are keyed as `p{partition}`, and the value is the seconds timestamp of the
/// partition's creation.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_byte_prefix*` methods.
pub const PREFIX_PARTITION: &[u8; 1] = b"p";
/// The metadata key prefix used for consumer group cursors.
///
/// Entries are keyed as `c{partition}{group}`, and the value is the next offset to be read by
/// the group on that partition.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_byte_prefix*` methods.
pub const PREFIX_CURSOR: &[u8; 1] = b"c";

/// A sled backed store of a topic's partitions and its consumer group cursors.
#[derive(Clone)]
pub struct TopicStore {
    inner: Arc<TopicStoreInner>,
}

struct TopicStoreInner {
    /// The name of the topic.
    topic: Arc<String>,
    /// The application's database system.
    db: Database,
    /// The topic's metadata tree, holding the partition registry and cursors.
    tree_metadata: Tree,
    /// All partition logs of this topic.
    partitions: RwLock<BTreeMap<PartitionId, Arc<Mutex<PartitionLog>>>>,
    /// A channel used for signalling the discovery of new partitions.
    partitions_tx: watch::Sender<BTreeSet<PartitionId>>,
    /// A channel used for signalling the discovery of new partitions.
    partitions_rx: watch::Receiver<BTreeSet<PartitionId>>,
}

/// The state of a single partition's log.
struct PartitionLog {
    /// The partition's database tree.
    tree: Tree,
    /// The offset which will be assigned to the next message written.
    next_offset: u64,
}

impl TopicStore {
    /// Open the store of the given topic, recovering all of its partitions from disk.
    pub async fn open(db: Database, topic: &str) -> Result<Self> {
        let tree_metadata = db.get_topic_tree_metadata(topic).await?;
        let ids = recover_partition_ids(tree_metadata.clone()).await?;

        let mut partitions = BTreeMap::new();
        for id in ids {
            let tree = db.get_partition_tree(topic, id).await?;
            let next_offset = recover_next_offset(tree.clone()).await?;
            tracing::debug!(topic, partition = %id, next_offset, "recovered partition");
            partitions.insert(id, Arc::new(Mutex::new(PartitionLog { tree, next_offset })));
        }

        let (partitions_tx, partitions_rx) = watch::channel(partitions.keys().copied().collect());
        Ok(Self {
            inner: Arc::new(TopicStoreInner {
                topic: Arc::new(topic.to_string()),
                db,
                tree_metadata,
                partitions: RwLock::new(partitions),
                partitions_tx,
                partitions_rx,
            }),
        })
    }

    /// The name of this store's topic.
    pub fn topic(&self) -> &str {
        self.inner.topic.as_str()
    }

    /// Ensure that partitions `0..count` exist, creating any which are missing.
    pub async fn ensure_partitions(&self, count: u32) -> Result<()> {
        for id in 0..count {
            self.create_partition(PartitionId(id)).await?;
        }
        Ok(())
    }

    /// Create the given partition, returning `false` if it already exists.
    ///
    /// Creating a partition signals its discovery to all partition watchers.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_partition(&self, id: PartitionId) -> Result<bool> {
        let mut partitions = self.inner.partitions.write().await;
        if partitions.contains_key(&id) {
            return Ok(false);
        }

        let tree = self.inner.db.get_partition_tree(&self.inner.topic, id).await?;
        let key = utils::encode_byte_prefix_u32(PREFIX_PARTITION, id.0);
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.inner
            .tree_metadata
            .insert(&key, &utils::encode_u64(now as u64))
            .context("error writing partition record to disk")
            .map_err(ShutdownError::from)?;
        self.inner
            .tree_metadata
            .flush_async()
            .await
            .context(ERR_DB_FLUSH)
            .map_err(ShutdownError::from)?;

        partitions.insert(id, Arc::new(Mutex::new(PartitionLog { tree, next_offset: 0 })));
        let _res = self.inner.partitions_tx.send(partitions.keys().copied().collect());
        tracing::debug!(topic = %self.inner.topic, partition = %id, "partition created");
        Ok(true)
    }

    /// Publish a batch of message payloads to the given partition, returning the offset of the
    /// last message written.
    #[tracing::instrument(level = "trace", skip(self, payloads))]
    pub async fn publish(&self, partition: PartitionId, payloads: Vec<Vec<u8>>) -> Result<u64> {
        if payloads.is_empty() {
            bail!(AppError::InvalidInput("message batch was empty, no-op".into()));
        }
        let log = self.partition_log(partition).await?;
        let mut log = log.lock().await;

        // Assign an offset to each entry in the payload and write as a batch.
        let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut batch = sled::Batch::default();
        let mut next_offset = log.next_offset;
        for data in payloads {
            let msg = utils::encode_model(&Message { offset: next_offset, timestamp, data }).context("error encoding message record for storage")?;
            batch.insert(&utils::encode_u64(next_offset), msg.as_slice());
            next_offset += 1;
        }
        log.tree
            .apply_batch(batch)
            .context("error applying write batch")
            .map_err(ShutdownError::from)?;
        log.tree
            .flush_async()
            .await
            .context(ERR_DB_FLUSH)
            .map_err(ShutdownError::from)?;

        log.next_offset = next_offset;
        tracing::trace!(partition = %partition, next_offset, "finished writing data to partition");
        Ok(next_offset - 1)
    }

    /// Get a handle to the log of the given partition.
    async fn partition_log(&self, partition: PartitionId) -> Result<Arc<Mutex<PartitionLog>>> {
        self.inner
            .partitions
            .read()
            .await
            .get(&partition)
            .cloned()
            .ok_or_else(|| AppError::ResourceNotFound(format!("partition {} of topic {}", partition, self.inner.topic)).into())
    }

    /// Get a handle to the DB tree of the given partition.
    async fn partition_tree(&self, partition: PartitionId) -> Result<Tree> {
        let log = self.partition_log(partition).await?;
        let tree = log.lock().await.tree.clone();
        Ok(tree)
    }
}

impl PartitionSource for TopicStore {
    fn current_partitions(&self) -> BTreeSet<PartitionId> {
        self.inner.partitions_rx.borrow().clone()
    }

    fn watch_partitions(&self) -> watch::Receiver<BTreeSet<PartitionId>> {
        self.inner.partitions_rx.clone()
    }
}

impl BatchReader for TopicStore {
    fn read(&self, partition: PartitionId, from_offset: u64, max_messages: u32) -> BoxFuture<'static, Result<Batch>> {
        let this = self.clone();
        Box::pin(async move {
            let tree = this.partition_tree(partition).await?;
            read_batch(tree, partition, from_offset, max_messages).await
        })
    }
}

impl CursorStore for TopicStore {
    fn get_cursor(&self, partition: PartitionId, group: &str) -> BoxFuture<'static, Result<u64>> {
        let (tree, key) = (self.inner.tree_metadata.clone(), cursor_key(partition, group));
        Box::pin(async move {
            let offset = Database::spawn_blocking(move || -> Result<u64> {
                tree.get(key)
                    .context("error fetching cursor from storage")?
                    .map(|val| utils::decode_u64(&val).context("error decoding cursor from storage"))
                    .transpose()
                    .map(|offset| offset.unwrap_or(0))
            })
            .await??;
            Ok(offset)
        })
    }

    fn set_cursor(&self, partition: PartitionId, group: &str, offset: u64) -> BoxFuture<'static, Result<()>> {
        let (tree, key) = (self.inner.tree_metadata.clone(), cursor_key(partition, group));
        Box::pin(async move {
            tree.insert(key, &utils::encode_u64(offset))
                .context("error updating cursor on disk")
                .map_err(ShutdownError::from)?;
            tree.flush_async().await.context(ERR_DB_FLUSH).map_err(ShutdownError::from)?;
            Ok(())
        })
    }
}

/// Build the metadata key of the cursor of the given group on the given partition.
pub fn cursor_key(partition: PartitionId, group: &str) -> sled::IVec {
    utils::encode_byte_prefix_u32_suffix(PREFIX_CURSOR, partition.0, group.as_bytes())
}

/// Read a batch of at most `max_messages` messages from the given partition tree.
#[tracing::instrument(level = "trace", skip(tree))]
async fn read_batch(tree: Tree, partition: PartitionId, from_offset: u64, max_messages: u32) -> Result<Batch> {
    Database::spawn_blocking(move || -> Result<Batch> {
        let start = utils::encode_u64(from_offset);
        let stop = utils::encode_u64(from_offset.saturating_add(max_messages as u64));
        let mut messages = Vec::with_capacity(max_messages as usize);
        for iter_res in tree.range(start..stop) {
            let (_key, val) = iter_res.context(ERR_ITER_FAILURE)?;
            let msg: Message = utils::decode_model(val.as_ref()).context("error decoding message from storage")?;
            messages.push(msg);
        }
        Ok(Batch::new(partition, from_offset, messages))
    })
    .await?
}

/// Recover the IDs of all partitions recorded in the given topic metadata tree.
async fn recover_partition_ids(tree: Tree) -> Result<Vec<PartitionId>> {
    let ids = Database::spawn_blocking(move || -> Result<Vec<PartitionId>> {
        let mut ids = vec![];
        for key_res in tree.scan_prefix(PREFIX_PARTITION).keys() {
            let key = key_res.context(ERR_ITER_FAILURE)?;
            let id = utils::decode_u32(&key[1..]).context("error decoding partition record key, data corrupted")?;
            ids.push(PartitionId(id));
        }
        Ok(ids)
    })
    .await??;
    Ok(ids)
}

/// Recover the next offset to be written to the given partition tree.
async fn recover_next_offset(tree: Tree) -> Result<u64> {
    let offset = Database::spawn_blocking(move || -> Result<u64> {
        let next_offset = tree
            .last()
            .context("error fetching last message record during recovery")?
            .map(|(key, _val)| utils::decode_u64(&key).context("error decoding message offset, data corrupted"))
            .transpose()?
            .map(|offset| offset + 1)
            .unwrap_or(0);
        Ok(next_offset)
    })
    .await??;
    Ok(offset)
}
