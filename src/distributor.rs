//! Partition distribution strategies.
//!
//! A distributor computes the desired partition assignment of a lock group from its ordered
//! member list and the topic's partitions. Distributors are pure and deterministic: the same
//! inputs in the same order always yield the same assignment.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;

use serde::Deserialize;

use crate::models::{MemberId, PartitionId};

/// A partition distribution strategy.
pub trait Distributor: Debug + Send + Sync {
    /// Compute the desired assignment of the given partitions over the given members.
    ///
    /// Members are iterated in the given order. Returns an empty map if there are no members or
    /// no partitions.
    fn distribute(&self, members: &[MemberId], partitions: &[PartitionId]) -> HashMap<MemberId, BTreeSet<PartitionId>>;
}

/// Hands out contiguous runs of partitions, `floor(P/M)` per member, with the remainder going
/// one each to the first members.
#[derive(Clone, Copy, Debug, Default)]
pub struct Modulo;

impl Distributor for Modulo {
    fn distribute(&self, members: &[MemberId], partitions: &[PartitionId]) -> HashMap<MemberId, BTreeSet<PartitionId>> {
        let mut assignment = HashMap::new();
        if members.is_empty() || partitions.is_empty() {
            return assignment;
        }
        let (per_member, remainder) = (partitions.len() / members.len(), partitions.len() % members.len());

        let mut partitions = partitions.iter().copied();
        for (idx, member) in members.iter().enumerate() {
            let count = if idx < remainder { per_member + 1 } else { per_member };
            if count == 0 {
                break;
            }
            assignment.insert(*member, partitions.by_ref().take(count).collect());
        }
        assignment
    }
}

/// Deals partitions round-robin, partition `i` going to member `i mod M`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dealer;

impl Distributor for Dealer {
    fn distribute(&self, members: &[MemberId], partitions: &[PartitionId]) -> HashMap<MemberId, BTreeSet<PartitionId>> {
        let mut assignment: HashMap<MemberId, BTreeSet<PartitionId>> = HashMap::new();
        if members.is_empty() {
            return assignment;
        }
        for (member, partition) in members.iter().cycle().zip(partitions.iter()) {
            assignment.entry(*member).or_default().insert(*partition);
        }
        assignment
    }
}

/// The distribution strategy selected by config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributorKind {
    #[default]
    Modulo,
    Dealer,
}

impl DistributorKind {
    /// Build a new instance of the selected distributor.
    pub fn build(self) -> Box<dyn Distributor> {
        match self {
            Self::Modulo => Box::new(Modulo),
            Self::Dealer => Box::new(Dealer),
        }
    }
}
