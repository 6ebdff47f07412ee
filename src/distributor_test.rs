use std::collections::{BTreeSet, HashMap};

use crate::distributor::{Dealer, Distributor, DistributorKind, Modulo};
use crate::models::{MemberId, PartitionId};

fn members(count: usize) -> Vec<MemberId> {
    (0..count).map(|_| MemberId::new()).collect()
}

fn partitions(count: u32) -> Vec<PartitionId> {
    (0..count).map(PartitionId).collect()
}

fn ids(vals: &[u32]) -> BTreeSet<PartitionId> {
    vals.iter().copied().map(PartitionId).collect()
}

/// Assert that the assignment covers every partition exactly once, and that member loads
/// differ by at most one.
fn assert_complete_and_even(assignment: &HashMap<MemberId, BTreeSet<PartitionId>>, members: &[MemberId], partitions: &[PartitionId]) {
    let total: usize = assignment.values().map(|set| set.len()).sum();
    assert_eq!(total, partitions.len(), "expected {} assigned partitions, got {}", partitions.len(), total);
    let union: BTreeSet<PartitionId> = assignment.values().flatten().copied().collect();
    assert_eq!(union.len(), partitions.len(), "expected every partition to be assigned exactly once");

    let loads: Vec<usize> = members.iter().map(|member| assignment.get(member).map(|set| set.len()).unwrap_or(0)).collect();
    let (min, max) = (loads.iter().min().copied().unwrap_or(0), loads.iter().max().copied().unwrap_or(0));
    assert!(max - min <= 1, "expected member loads to differ by at most 1, got {:?}", loads);
}

#[test]
fn modulo_hands_out_contiguous_runs_with_remainder_first() {
    let (members, partitions) = (members(3), partitions(7));

    let assignment = Modulo.distribute(&members, &partitions);

    assert_eq!(assignment.get(&members[0]), Some(&ids(&[0, 1, 2])), "expected first member to own 0..=2");
    assert_eq!(assignment.get(&members[1]), Some(&ids(&[3, 4])), "expected second member to own 3..=4");
    assert_eq!(assignment.get(&members[2]), Some(&ids(&[5, 6])), "expected third member to own 5..=6");
    assert_complete_and_even(&assignment, &members, &partitions);
}

#[test]
fn dealer_deals_round_robin() {
    let (members, partitions) = (members(3), partitions(7));

    let assignment = Dealer.distribute(&members, &partitions);

    assert_eq!(assignment.get(&members[0]), Some(&ids(&[0, 3, 6])), "expected first member to own 0, 3 & 6");
    assert_eq!(assignment.get(&members[1]), Some(&ids(&[1, 4])), "expected second member to own 1 & 4");
    assert_eq!(assignment.get(&members[2]), Some(&ids(&[2, 5])), "expected third member to own 2 & 5");
    assert_complete_and_even(&assignment, &members, &partitions);
}

#[test]
fn strategies_are_complete_and_even_across_shapes() {
    for kind in [DistributorKind::Modulo, DistributorKind::Dealer] {
        let distributor = kind.build();
        for member_count in 1..=6 {
            for partition_count in 0..=20 {
                let (members, partitions) = (members(member_count), partitions(partition_count));
                let assignment = distributor.distribute(&members, &partitions);
                assert_complete_and_even(&assignment, &members, &partitions);
            }
        }
    }
}

#[test]
fn more_members_than_partitions_leaves_some_idle() {
    let (members, partitions) = (members(5), partitions(2));

    for kind in [DistributorKind::Modulo, DistributorKind::Dealer] {
        let assignment = kind.build().distribute(&members, &partitions);
        assert_eq!(assignment.len(), 2, "{:?}: expected only 2 members to receive partitions, got {}", kind, assignment.len());
        assert!(assignment.get(&members[4]).is_none(), "{:?}: expected last member to be idle", kind);
    }
}

#[test]
fn empty_inputs_yield_empty_assignment() {
    for kind in [DistributorKind::Modulo, DistributorKind::Dealer] {
        let distributor = kind.build();
        assert!(distributor.distribute(&[], &partitions(4)).is_empty(), "{:?}: expected empty map with no members", kind);
        assert!(distributor.distribute(&members(3), &[]).is_empty(), "{:?}: expected empty map with no partitions", kind);
    }
}

#[test]
fn distribution_is_deterministic() {
    let (members, partitions) = (members(4), partitions(13));

    for kind in [DistributorKind::Modulo, DistributorKind::Dealer] {
        let distributor = kind.build();
        let first = distributor.distribute(&members, &partitions);
        let second = distributor.distribute(&members, &partitions);
        assert_eq!(first, second, "{:?}: expected identical output for identical input", kind);
    }
}
