//! Lock group state and its controller.
//!
//! A `LockGroup` holds the lease table of a single consumer group and computes, on every
//! rebalance, the notifications needed to move the group towards its desired assignment. It is
//! purely synchronous. `LockGroupCtl` owns a `LockGroup` and is the only task which ever touches
//! it: every trigger (membership, topology, acknowledgements, retries) arrives as a message on
//! the controller's queue, and listener notifications run in independently spawned tasks which
//! post their outcome back to that same queue.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use rand::prelude::*;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::distributor::Distributor;
use crate::error::LockError;
use crate::lock::{GroupAssignment, LockListener, LockManagerMsg, METRIC_ACK_FAILURES, METRIC_GROUP_MEMBERS, METRIC_PROTOCOL_VIOLATIONS, METRIC_REBALANCES};
use crate::models::{AckState, LockState, MemberId, PartitionId};

/// The max amount of jitter added to ack retry delays, as a fraction of the delay.
const RETRY_JITTER: f64 = 0.2;

/// A member's hold on a single partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    /// The acknowledgement state of this lease.
    pub state: AckState,
    /// The notification which a pending lease is waiting on.
    pub intent: LockState,
    /// The epoch of the last notification issued for this lease.
    pub epoch: u64,
    /// Set when the last notification failed or timed out, and must be issued again.
    pub stalled: bool,
}

/// A lease notification to be delivered to a member's listener.
#[derive(Clone)]
pub struct Notification {
    pub member: MemberId,
    pub listener: Arc<dyn LockListener>,
    pub partition: PartitionId,
    pub state: LockState,
    pub epoch: u64,
}

/// The outcome of a listener's acknowledgement of a notification.
pub struct AckResult {
    pub member: MemberId,
    pub partition: PartitionId,
    pub state: LockState,
    pub epoch: u64,
    pub result: Result<()>,
}

/// The effect of applying an acknowledgement to the lease table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledgement moved the lease forward.
    Applied,
    /// The acknowledgement failed, and the lease is now stalled awaiting re-issue.
    Stalled,
    /// The acknowledgement was outdated and has been ignored.
    Stale,
}

/// The lease state of a single consumer group.
pub struct LockGroup {
    /// The name of this group.
    name: Arc<String>,
    /// The strategy used to compute the group's desired assignment.
    distributor: Box<dyn Distributor>,
    /// All members of this group in subscription order, which is the distribution order.
    members: Vec<(MemberId, Arc<dyn LockListener>)>,
    /// Unsubscribed members which still hold leases, and are being asked to release them.
    departing: HashMap<MemberId, Arc<dyn LockListener>>,
    /// The leases held by each member.
    ///
    /// A partition appears under at most one member at any time.
    assignment: HashMap<MemberId, BTreeMap<PartitionId, Lease>>,
    /// The current partitions of the topic.
    partitions: BTreeSet<PartitionId>,
    /// The epoch which will be stamped on the next notification.
    next_epoch: u64,
}

impl LockGroup {
    /// Create a new instance.
    pub fn new(name: Arc<String>, distributor: Box<dyn Distributor>, partitions: BTreeSet<PartitionId>) -> Self {
        Self {
            name,
            distributor,
            members: vec![],
            departing: HashMap::new(),
            assignment: HashMap::new(),
            partitions,
            next_epoch: 1,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if this group has neither members nor departing members with leases left.
    pub fn is_idle(&self) -> bool {
        self.members.is_empty() && self.departing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Add a new member to this group.
    pub fn subscribe(&mut self, member: MemberId, listener: Arc<dyn LockListener>) {
        if self.members.iter().any(|(id, _)| *id == member) {
            return;
        }
        self.members.push((member, listener));
        self.assignment.insert(member, BTreeMap::new());
    }

    /// Remove a member from this group's distribution.
    ///
    /// The member keeps its leases until it has released them through the following
    /// rebalances. Returns `false` if the member was unknown.
    pub fn unsubscribe(&mut self, member: MemberId) -> bool {
        let idx = match self.members.iter().position(|(id, _)| *id == member) {
            Some(idx) => idx,
            None => return false,
        };
        let (_, listener) = self.members.remove(idx);
        let holds_leases = self.assignment.get(&member).map(|leases| !leases.is_empty()).unwrap_or(false);
        if holds_leases {
            self.departing.insert(member, listener);
        } else {
            self.assignment.remove(&member);
        }
        true
    }

    /// Update the topic's partitions, returning `true` if they changed.
    pub fn set_partitions(&mut self, partitions: BTreeSet<PartitionId>) -> bool {
        if self.partitions == partitions {
            return false;
        }
        self.partitions = partitions;
        true
    }

    /// A snapshot of this group's current assignment.
    pub fn snapshot(&self) -> GroupAssignment {
        self.assignment
            .iter()
            .map(|(member, leases)| (*member, leases.iter().map(|(partition, lease)| (*partition, lease.state)).collect()))
            .collect()
    }

    /// The lease held by the given member on the given partition, if any.
    pub fn lease(&self, member: MemberId, partition: PartitionId) -> Option<Lease> {
        self.assignment.get(&member).and_then(|leases| leases.get(&partition)).copied()
    }

    /// Compute the notifications which move this group towards its desired assignment.
    ///
    /// Stalled notifications are issued again first. Then for every partition of the desired
    /// assignment: an unheld partition is locked by its desired member, and an acknowledged
    /// lease held by any other member is released. Departing members are in no desired
    /// assignment, so all of their leases are released. Pending leases are left alone until
    /// their acknowledgement arrives. A partition is never locked while another member holds it.
    pub fn rebalance(&mut self) -> Vec<Notification> {
        let mut out = vec![];

        // Re-issue all stalled notifications under a new epoch. A departing member is asked to
        // release instead of lock.
        let holders = self.members.iter().map(|(id, listener)| (id, listener)).chain(self.departing.iter());
        for (member, listener) in holders {
            let leases = match self.assignment.get_mut(member) {
                Some(leases) => leases,
                None => continue,
            };
            let departing = self.departing.contains_key(member);
            for (partition, lease) in leases.iter_mut().filter(|(_, lease)| lease.stalled) {
                if departing {
                    lease.intent = LockState::Releasing;
                }
                lease.stalled = false;
                lease.epoch = self.next_epoch;
                self.next_epoch += 1;
                out.push(Notification {
                    member: *member,
                    listener: listener.clone(),
                    partition: *partition,
                    state: lease.intent,
                    epoch: lease.epoch,
                });
            }
        }

        let member_ids: Vec<MemberId> = self.members.iter().map(|(id, _)| *id).collect();
        let partitions: Vec<PartitionId> = self.partitions.iter().copied().collect();
        let desired = self.distributor.distribute(&member_ids, &partitions);

        // Release every acknowledged lease which its holder is no longer meant to have.
        let holders = self.members.iter().map(|(id, listener)| (id, listener)).chain(self.departing.iter());
        for (member, listener) in holders {
            let leases = match self.assignment.get_mut(member) {
                Some(leases) => leases,
                None => continue,
            };
            let wanted = desired.get(member);
            for (partition, lease) in leases.iter_mut() {
                if lease.state != AckState::Acked || wanted.map(|set| set.contains(partition)).unwrap_or(false) {
                    continue;
                }
                *lease = Lease {
                    state: AckState::Pending,
                    intent: LockState::Releasing,
                    epoch: self.next_epoch,
                    stalled: false,
                };
                self.next_epoch += 1;
                out.push(Notification {
                    member: *member,
                    listener: listener.clone(),
                    partition: *partition,
                    state: LockState::Releasing,
                    epoch: lease.epoch,
                });
            }
        }

        // Lock every desired partition which is not held by anyone.
        let held: BTreeSet<PartitionId> = self.assignment.values().flat_map(|leases| leases.keys().copied()).collect();
        for (member, listener) in self.members.iter() {
            let wanted = match desired.get(member) {
                Some(wanted) => wanted,
                None => continue,
            };
            let leases = self.assignment.entry(*member).or_default();
            for partition in wanted.iter().filter(|partition| !held.contains(partition)) {
                let epoch = self.next_epoch;
                self.next_epoch += 1;
                leases.insert(
                    *partition,
                    Lease {
                        state: AckState::Pending,
                        intent: LockState::Locked,
                        epoch,
                        stalled: false,
                    },
                );
                out.push(Notification {
                    member: *member,
                    listener: listener.clone(),
                    partition: *partition,
                    state: LockState::Locked,
                    epoch,
                });
            }
        }

        out
    }

    /// Apply a listener's acknowledgement to the lease table.
    ///
    /// Acknowledgements from fully departed members, or for an outdated epoch, are stale. An
    /// acknowledgement from a current or departing member for a partition it holds no lease on
    /// is a protocol violation. A departing member is forgotten once its last lease is released.
    pub fn ack(&mut self, member: MemberId, partition: PartitionId, state: LockState, epoch: u64, ok: bool) -> Result<AckOutcome, LockError> {
        let departing = self.departing.contains_key(&member);
        if !departing && !self.members.iter().any(|(id, _)| *id == member) {
            return Ok(AckOutcome::Stale);
        }
        let leases = self
            .assignment
            .get_mut(&member)
            .ok_or(LockError::ProtocolViolation { member, partition })?;
        let lease = leases
            .get_mut(&partition)
            .ok_or(LockError::ProtocolViolation { member, partition })?;
        if lease.epoch != epoch || lease.intent != state || lease.state == AckState::Acked {
            return Ok(AckOutcome::Stale);
        }

        if !ok {
            lease.stalled = true;
            return Ok(AckOutcome::Stalled);
        }
        match state {
            LockState::Locked => lease.state = AckState::Acked,
            LockState::Releasing => {
                leases.remove(&partition);
                if departing && leases.is_empty() {
                    self.assignment.remove(&member);
                    self.departing.remove(&member);
                }
            }
        }
        Ok(AckOutcome::Applied)
    }
}

/// A controller owning the state of a single lock group.
pub struct LockGroupCtl {
    /// The group's lease state.
    group: LockGroup,
    /// The time a listener has to acknowledge a notification.
    ack_timeout: Duration,
    /// The delay before stalled notifications are issued again, if enabled.
    ack_retry: Option<Duration>,

    /// A channel of events to be processed by this controller.
    events_tx: mpsc::Sender<LockGroupMsg>,
    /// A channel of events to be processed by this controller.
    events_rx: ReceiverStream<LockGroupMsg>,
    /// A channel to the lock manager, used to report that this group has gone idle.
    manager_tx: mpsc::Sender<LockManagerMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A bool indicating that a retry rebalance has already been scheduled.
    retry_scheduled: bool,
    /// A bool indicating that this controller has been descheduled and needs to shutdown.
    descheduled: bool,
}

impl LockGroupCtl {
    /// Create a new instance.
    pub(super) fn new(
        group: LockGroup, ack_timeout: Duration, ack_retry: Option<Duration>, shutdown_tx: &broadcast::Sender<()>, events_tx: mpsc::Sender<LockGroupMsg>,
        events_rx: mpsc::Receiver<LockGroupMsg>, manager_tx: mpsc::Sender<LockManagerMsg>,
    ) -> Self {
        Self {
            group,
            ack_timeout,
            ack_retry,
            events_tx,
            events_rx: ReceiverStream::new(events_rx),
            manager_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            retry_scheduled: false,
            descheduled: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(group = self.group.name(), "lock group controller has started");

        loop {
            if self.descheduled {
                break;
            }
            tokio::select! {
                msg_opt = self.events_rx.next() => match msg_opt {
                    Some(msg) => self.handle_msg(msg).await,
                    None => break,
                },
                _ = self.shutdown_rx.next() => break,
            }
        }

        metrics::gauge!(METRIC_GROUP_MEMBERS, 0.0, "group" => self.group.name().to_string());
        tracing::debug!(group = self.group.name(), "lock group controller has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, msg), fields(group = self.group.name()))]
    async fn handle_msg(&mut self, msg: LockGroupMsg) {
        match msg {
            LockGroupMsg::Subscribe { member, listener } => self.handle_subscribe(member, listener),
            LockGroupMsg::Unsubscribe { member } => self.handle_unsubscribe(member),
            LockGroupMsg::Topology(partitions) => self.handle_topology(partitions),
            LockGroupMsg::Ack(ack) => self.handle_ack(ack),
            LockGroupMsg::Assignment(tx) => {
                let _res = tx.send(Some(self.group.snapshot()));
            }
            LockGroupMsg::Retry => {
                self.retry_scheduled = false;
                self.rebalance();
            }
            LockGroupMsg::Deschedule(tx) => {
                // A group which has regained members or leases since it reported idle stays up,
                // and reports again once it next goes idle.
                self.descheduled = self.group.is_idle();
                let _res = tx.send(self.descheduled);
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, listener))]
    fn handle_subscribe(&mut self, member: MemberId, listener: Arc<dyn LockListener>) {
        self.group.subscribe(member, listener);
        tracing::debug!(group = self.group.name(), %member, "member subscribed to lock group");
        self.record_members();
        self.rebalance();
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_unsubscribe(&mut self, member: MemberId) {
        if !self.group.unsubscribe(member) {
            return;
        }
        tracing::debug!(group = self.group.name(), %member, "member unsubscribed from lock group");
        self.record_members();
        if self.group.is_empty() {
            tracing::debug!(group = self.group.name(), "lock group has no members left, releasing remaining leases");
        }
        self.rebalance();
        self.report_if_idle();
    }

    #[tracing::instrument(level = "trace", skip(self, partitions))]
    fn handle_topology(&mut self, partitions: BTreeSet<PartitionId>) {
        if self.group.set_partitions(partitions) {
            self.rebalance();
        }
    }

    #[tracing::instrument(level = "trace", skip(self, ack), fields(member = %ack.member, partition = %ack.partition, state = %ack.state))]
    fn handle_ack(&mut self, ack: AckResult) {
        let AckResult {
            member,
            partition,
            state,
            epoch,
            result,
        } = ack;
        if let Err(err) = &result {
            tracing::warn!(error = ?err, group = self.group.name(), %member, %partition, %state, "lock listener failed to acknowledge lease transition");
            metrics::increment_counter!(METRIC_ACK_FAILURES);
        }

        match self.group.ack(member, partition, state, epoch, result.is_ok()) {
            Ok(AckOutcome::Applied) => {
                self.rebalance();
                self.report_if_idle();
            }
            Ok(AckOutcome::Stalled) => self.schedule_retry(),
            Ok(AckOutcome::Stale) => tracing::debug!(group = self.group.name(), %member, %partition, epoch, "stale lease acknowledgement ignored"),
            Err(err) => {
                tracing::error!(error = ?err, group = self.group.name(), "lease acknowledgement rejected");
                metrics::increment_counter!(METRIC_PROTOCOL_VIOLATIONS);
            }
        }
    }

    /// Rebalance the group and dispatch the resulting notifications.
    fn rebalance(&mut self) {
        metrics::increment_counter!(METRIC_REBALANCES);
        let notifications = self.group.rebalance();
        if !notifications.is_empty() {
            tracing::debug!(group = self.group.name(), count = notifications.len(), "dispatching lease notifications");
        }
        for notification in notifications {
            self.spawn_notification(notification);
        }
    }

    /// Spawn a task which delivers the given notification and posts back its acknowledgement.
    fn spawn_notification(&self, notification: Notification) {
        let (tx, timeout) = (self.events_tx.clone(), self.ack_timeout);
        tokio::spawn(async move {
            let Notification {
                member,
                listener,
                partition,
                state,
                epoch,
            } = notification;
            let fut = listener.on_lock_state(partition, state, timeout);
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(res) => res,
                Err(_elapsed) => Err(LockError::AckTimeout(timeout).into()),
            };
            let _res = tx
                .send(LockGroupMsg::Ack(AckResult {
                    member,
                    partition,
                    state,
                    epoch,
                    result,
                }))
                .await;
        });
    }

    /// Schedule a rebalance which will issue stalled notifications again.
    fn schedule_retry(&mut self) {
        let delay = match self.ack_retry {
            Some(delay) => delay,
            None => return,
        };
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        let delay = delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..RETRY_JITTER));
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _res = tx.send(LockGroupMsg::Retry).await;
        });
    }

    /// Report to the manager that this group has neither members nor leases.
    fn report_if_idle(&self) {
        if !self.group.is_idle() {
            return;
        }
        tracing::debug!(group = self.group.name(), "lock group is idle");
        let (tx, group) = (self.manager_tx.clone(), self.group.name().to_string());
        tokio::spawn(async move {
            let _res = tx.send(LockManagerMsg::GroupIdle { group }).await;
        });
    }

    fn record_members(&self) {
        metrics::gauge!(METRIC_GROUP_MEMBERS, self.group.len() as f64, "group" => self.group.name().to_string());
    }
}

/// A message bound for a lock group controller.
pub enum LockGroupMsg {
    /// A new member is joining the group.
    Subscribe { member: MemberId, listener: Arc<dyn LockListener> },
    /// A member is leaving the group.
    Unsubscribe { member: MemberId },
    /// The topic's partitions have changed.
    Topology(BTreeSet<PartitionId>),
    /// A listener has settled its acknowledgement of a notification.
    Ack(AckResult),
    /// A request for a snapshot of the group's assignment.
    Assignment(oneshot::Sender<Option<GroupAssignment>>),
    /// Stalled notifications are due to be issued again.
    Retry,
    /// A request from the manager to shut down if still idle, answering whether it will.
    Deschedule(oneshot::Sender<bool>),
}
