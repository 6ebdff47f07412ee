//! Storage collaborators consumed by the lease coordinator and partition readers.
//!
//! The coordinator and readers only ever see the narrow traits declared here. `TopicStore` is
//! the sled backed implementation used by the server.

mod topic;
#[cfg(test)]
mod topic_test;

use std::collections::BTreeSet;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::models::{Batch, PartitionId};

pub use topic::TopicStore;

/// A source of the partitions of a topic.
pub trait PartitionSource: Send + Sync + 'static {
    /// The current set of partitions of the topic.
    fn current_partitions(&self) -> BTreeSet<PartitionId>;

    /// A watch over the topic's partition set, which changes every time a new partition is
    /// discovered.
    fn watch_partitions(&self) -> watch::Receiver<BTreeSet<PartitionId>>;
}

/// A reader of sequential message batches from topic partitions.
pub trait BatchReader: Send + Sync + 'static {
    /// Read at most `max_messages` messages from the given partition starting at `from_offset`.
    fn read(&self, partition: PartitionId, from_offset: u64, max_messages: u32) -> BoxFuture<'static, Result<Batch>>;
}

/// A durable store of per partition, per consumer group read cursors.
pub trait CursorStore: Send + Sync + 'static {
    /// Get the cursor of the given group on the given partition, `0` if none has been recorded.
    fn get_cursor(&self, partition: PartitionId, group: &str) -> BoxFuture<'static, Result<u64>>;

    /// Durably record the cursor of the given group on the given partition.
    fn set_cursor(&self, partition: PartitionId, group: &str, offset: u64) -> BoxFuture<'static, Result<()>>;
}
