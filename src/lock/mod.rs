//! Partition lease coordination.
//!
//! The lock manager assigns the partitions of a topic to the members of named consumer groups,
//! such that at most one member of a group holds any partition at any instant. Members are told
//! about lease transitions through their `LockListener`, and a partition is only ever offered to
//! a new member after its previous holder has acknowledged its release.
//!
//! Each group is owned by its own `LockGroupCtl` task. The `LockManagerCtl` only routes
//! membership requests to groups and forwards topology changes of the topic to all of them.

mod group;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::error::{AppError, LockError};
use crate::lock::group::{LockGroup, LockGroupCtl, LockGroupMsg};
use crate::models::{AckState, LockState, MemberId, PartitionId};
use crate::storage::PartitionSource;

pub(self) const METRIC_REBALANCES: &str = "hadron_lease_rebalances";
pub(self) const METRIC_GROUPS: &str = "hadron_lease_groups";
pub(self) const METRIC_GROUP_MEMBERS: &str = "hadron_lease_group_members";
pub(self) const METRIC_ACK_FAILURES: &str = "hadron_lease_ack_failures";
pub(self) const METRIC_PROTOCOL_VIOLATIONS: &str = "hadron_lease_protocol_violations";

/// The capacity of each controller's event queue.
const QUEUE_CAPACITY: usize = 1000;

/// A snapshot of a group's assignment: the acknowledgement state of every lease of every member.
pub type GroupAssignment = BTreeMap<MemberId, BTreeMap<PartitionId, AckState>>;

/// A listener of lease transitions, supplied by a group member when it subscribes.
pub trait LockListener: Send + Sync + 'static {
    /// Handle a lease transition of the given partition.
    ///
    /// The returned future is the member's acknowledgement. For `Locked`, it resolves once the
    /// member is ready to consume the partition. For `Releasing`, it must only resolve once the
    /// member has fully stopped consuming the partition. A future which does not resolve within
    /// `timeout` is treated as a failed acknowledgement.
    fn on_lock_state(&self, partition: PartitionId, state: LockState, timeout: Duration) -> BoxFuture<'static, Result<()>>;
}

/// A handle to the lock manager.
#[derive(Clone)]
pub struct LockManager {
    tx: mpsc::Sender<LockManagerMsg>,
}

impl LockManager {
    /// Spawn a new lock manager over the partitions of the given source.
    pub fn start(config: Arc<Config>, partitions: Arc<dyn PartitionSource>, shutdown_tx: broadcast::Sender<()>) -> (Self, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = LockManagerCtl::new(config, partitions, shutdown_tx, tx.clone(), rx).spawn();
        (Self { tx }, handle)
    }

    /// Subscribe the given listener to the named group, creating the group if needed.
    ///
    /// The returned ID identifies the new member for the lifetime of its subscription.
    pub async fn subscribe(&self, group: &str, listener: Arc<dyn LockListener>) -> Result<MemberId> {
        if group.is_empty() {
            bail!(AppError::InvalidInput("lock group name may not be an empty string".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.send(LockManagerMsg::Subscribe {
            group: group.to_string(),
            listener,
            tx,
        })
        .await?;
        rx.await.map_err(|_| LockError::ManagerClosed)?
    }

    /// Unsubscribe the given member from the named group.
    ///
    /// The member is sent RELEASING for every partition it still holds, and those partitions
    /// are only reassigned once released. Returns `false` if the group or the member was
    /// unknown, in which case this is a no-op.
    pub async fn unsubscribe(&self, group: &str, member: MemberId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(LockManagerMsg::Unsubscribe {
            group: group.to_string(),
            member,
            tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| LockError::ManagerClosed)?)
    }

    /// A snapshot of the named group's assignment, `None` if the group does not exist.
    pub async fn assignment(&self, group: &str) -> Result<Option<GroupAssignment>> {
        let (tx, rx) = oneshot::channel();
        self.send(LockManagerMsg::Assignment { group: group.to_string(), tx }).await?;
        Ok(rx.await.map_err(|_| LockError::ManagerClosed)?)
    }

    /// The names of all live groups.
    pub async fn groups(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(LockManagerMsg::Groups(tx)).await?;
        Ok(rx.await.map_err(|_| LockError::ManagerClosed)?)
    }

    async fn send(&self, msg: LockManagerMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| LockError::ManagerClosed)?;
        Ok(())
    }
}

/// A message bound for the lock manager controller.
enum LockManagerMsg {
    Subscribe {
        group: String,
        listener: Arc<dyn LockListener>,
        tx: oneshot::Sender<Result<MemberId>>,
    },
    Unsubscribe {
        group: String,
        member: MemberId,
        tx: oneshot::Sender<bool>,
    },
    Assignment {
        group: String,
        tx: oneshot::Sender<Option<GroupAssignment>>,
    },
    Groups(oneshot::Sender<Vec<String>>),
    /// A group controller has no members and holds no leases.
    GroupIdle {
        group: String,
    },
}

/// The manager's handle to a live group controller.
struct GroupHandle {
    /// The group controller's event queue.
    tx: mpsc::Sender<LockGroupMsg>,
    /// The members of the group, as known to the manager.
    members: HashSet<MemberId>,
    /// The join handle of the group controller.
    handle: JoinHandle<Result<()>>,
}

/// A controller routing membership requests and topology changes to lock groups.
struct LockManagerCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The current partitions of the topic.
    partitions: BTreeSet<PartitionId>,
    /// All live groups, by name.
    groups: HashMap<String, GroupHandle>,

    /// A channel of requests to be processed by this controller.
    events_tx: mpsc::Sender<LockManagerMsg>,
    /// A channel of requests to be processed by this controller.
    events_rx: ReceiverStream<LockManagerMsg>,
    /// A stream of the topic's partition set.
    topology: WatchStream<BTreeSet<PartitionId>>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl LockManagerCtl {
    fn new(
        config: Arc<Config>, partitions: Arc<dyn PartitionSource>, shutdown_tx: broadcast::Sender<()>, events_tx: mpsc::Sender<LockManagerMsg>,
        events_rx: mpsc::Receiver<LockManagerMsg>,
    ) -> Self {
        metrics::register_counter!(METRIC_REBALANCES, metrics::Unit::Count, "the number of lock group rebalances executed");
        metrics::register_gauge!(METRIC_GROUPS, metrics::Unit::Count, "the number of live lock groups");
        metrics::register_gauge!(METRIC_GROUP_MEMBERS, metrics::Unit::Count, "the number of members of a lock group");
        metrics::register_counter!(METRIC_ACK_FAILURES, metrics::Unit::Count, "lease acknowledgements which failed or timed out");
        metrics::register_counter!(METRIC_PROTOCOL_VIOLATIONS, metrics::Unit::Count, "lease acknowledgements rejected as protocol violations");
        Self {
            config,
            partitions: partitions.current_partitions(),
            groups: HashMap::new(),
            events_tx,
            events_rx: ReceiverStream::new(events_rx),
            topology: WatchStream::new(partitions.watch_partitions()),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("lock manager has started");

        loop {
            tokio::select! {
                Some(msg) = self.events_rx.next() => self.handle_msg(msg).await,
                Some(partitions) = self.topology.next() => self.handle_topology(partitions).await,
                _ = self.shutdown_rx.next() => break,
                else => break,
            }
        }

        // Begin shutdown routine.
        for (name, group) in self.groups.drain() {
            if let Err(err) = group.handle.await.context("error joining lock group controller handle").and_then(|res| res) {
                tracing::error!(error = ?err, group = %name, "error shutting down lock group controller");
            }
        }
        metrics::gauge!(METRIC_GROUPS, 0.0);
        tracing::debug!("lock manager has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_msg(&mut self, msg: LockManagerMsg) {
        match msg {
            LockManagerMsg::Subscribe { group, listener, tx } => {
                let res = self.handle_subscribe(group, listener).await;
                let _res = tx.send(res);
            }
            LockManagerMsg::Unsubscribe { group, member, tx } => {
                let res = self.handle_unsubscribe(group, member).await;
                let _res = tx.send(res);
            }
            LockManagerMsg::Assignment { group, tx } => match self.groups.get(&group) {
                Some(handle) => {
                    let _res = handle.tx.send(LockGroupMsg::Assignment(tx)).await;
                }
                None => {
                    let _res = tx.send(None);
                }
            },
            LockManagerMsg::Groups(tx) => {
                let mut names: Vec<String> = self.groups.keys().cloned().collect();
                names.sort();
                let _res = tx.send(names);
            }
            LockManagerMsg::GroupIdle { group } => self.handle_group_idle(group).await,
        }
    }

    #[tracing::instrument(level = "trace", skip(self, listener))]
    async fn handle_subscribe(&mut self, group: String, listener: Arc<dyn LockListener>) -> Result<MemberId> {
        let member = MemberId::new();
        if !self.groups.contains_key(&group) {
            let handle = self.spawn_group(&group);
            self.groups.insert(group.clone(), handle);
            metrics::gauge!(METRIC_GROUPS, self.groups.len() as f64);
        }
        let handle = self.groups.get_mut(&group).context("lock group vanished while subscribing")?;
        if handle.tx.send(LockGroupMsg::Subscribe { member, listener }).await.is_err() {
            // The group controller has already shut down.
            if let Some(handle) = self.groups.remove(&group) {
                handle.handle.abort();
            }
            metrics::gauge!(METRIC_GROUPS, self.groups.len() as f64);
            return Err(LockError::ManagerClosed.into());
        }
        handle.members.insert(member);
        Ok(member)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_unsubscribe(&mut self, group: String, member: MemberId) -> bool {
        let handle = match self.groups.get_mut(&group) {
            Some(handle) => handle,
            None => return false,
        };
        if !handle.members.remove(&member) {
            return false;
        }
        let _res = handle.tx.send(LockGroupMsg::Unsubscribe { member }).await;
        true
    }

    /// Discard a group which has reported itself idle, unless it has gained members since.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_group_idle(&mut self, group: String) {
        let handle = match self.groups.get(&group) {
            Some(handle) if handle.members.is_empty() => handle,
            _ => return,
        };
        let (tx, rx) = oneshot::channel();
        let descheduled = match handle.tx.send(LockGroupMsg::Deschedule(tx)).await {
            // A controller which went away without answering is already gone.
            Ok(()) => rx.await.unwrap_or(true),
            Err(_) => true,
        };
        if !descheduled {
            return;
        }
        if let Some(handle) = self.groups.remove(&group) {
            if let Err(err) = handle.handle.await.context("error joining lock group controller handle").and_then(|res| res) {
                tracing::error!(error = ?err, %group, "error shutting down lock group controller");
            }
        }
        metrics::gauge!(METRIC_GROUPS, self.groups.len() as f64);
        tracing::debug!(%group, "lock group discarded as it has no more members or leases");
    }

    #[tracing::instrument(level = "trace", skip(self, partitions))]
    async fn handle_topology(&mut self, partitions: BTreeSet<PartitionId>) {
        if partitions == self.partitions {
            return;
        }
        tracing::debug!(count = partitions.len(), "topic partitions changed");
        self.partitions = partitions;
        for (name, handle) in self.groups.iter() {
            if handle.tx.send(LockGroupMsg::Topology(self.partitions.clone())).await.is_err() {
                tracing::warn!(group = %name, "lock group controller closed before receiving topology update");
            }
        }
    }

    /// Spawn a new group controller.
    fn spawn_group(&self, name: &str) -> GroupHandle {
        let group = LockGroup::new(Arc::new(name.to_string()), self.config.distributor.build(), self.partitions.clone());
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = LockGroupCtl::new(
            group,
            self.config.lock_ack_timeout(),
            self.config.lock_ack_retry(),
            &self.shutdown_tx,
            tx.clone(),
            rx,
            self.events_tx.clone(),
        )
        .spawn();
        GroupHandle {
            tx,
            members: HashSet::new(),
            handle,
        }
    }
}
