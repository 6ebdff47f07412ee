//! Data models shared by the lease coordinator, the partition readers and storage.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The ID of a topic partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An opaque handle identifying a member of a lock group.
///
/// Handles are issued by the lock manager when a listener subscribes, and are the only way to
/// refer to that subscription afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Roll a new random member ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The lease state requested of a lock listener for a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockState {
    /// The member now holds the partition's lease and may begin consuming it.
    Locked,
    /// The member must stop consuming the partition and give up its lease.
    Releasing,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => f.write_str("LOCKED"),
            Self::Releasing => f.write_str("RELEASING"),
        }
    }
}

/// The acknowledgement state of a member's hold on a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckState {
    /// A lease was granted or a release was requested, and the member has not yet confirmed.
    Pending,
    /// The member has confirmed that it holds the partition.
    Acked,
}

/// A message record of a topic partition, as stored on disk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// The offset of this message within its partition.
    #[prost(uint64, required, tag = "1")]
    pub offset: u64,
    /// The seconds timestamp of when this message was written.
    #[prost(int64, required, tag = "2")]
    pub timestamp: i64,
    /// The data payload of this message.
    #[prost(bytes = "vec", required, tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// A batch of sequential messages read from a partition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    /// The partition from which this batch was read.
    pub partition: PartitionId,
    /// The offset from which this batch was read.
    pub start_offset: u64,
    /// The offset immediately following the last message of this batch.
    ///
    /// For an empty batch this is the same as `start_offset`.
    pub next_offset: u64,
    /// The messages of this batch, in offset order.
    pub messages: Vec<Message>,
}

impl Batch {
    /// Create a new batch from the given messages read at `start_offset`.
    pub fn new(partition: PartitionId, start_offset: u64, messages: Vec<Message>) -> Self {
        let next_offset = messages.last().map(|msg| msg.offset + 1).unwrap_or(start_offset);
        Self {
            partition,
            start_offset,
            next_offset,
            messages,
        }
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
