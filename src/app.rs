use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::lock::LockManager;
use crate::member::{ConsumerMember, LoggingConsumer};
use crate::models::MemberId;
use crate::server::spawn_prom_server;
use crate::storage::TopicStore;

/// The interval at which shutdown polls for the release of the lock group's leases.
const GROUP_RELEASE_POLL: Duration = Duration::from_millis(50);

/// The application object for when the lease coordinator is running as a server.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The topic served by this process.
    _store: TopicStore,

    /// A handle to the lock manager.
    manager: LockManager,
    /// All in-process consumer members, along with their member IDs.
    members: Vec<(MemberId, ConsumerMember)>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the lock manager.
    manager_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let store = TopicStore::open(db.clone(), &config.topic)
            .await
            .context("error opening topic storage")?;
        store
            .ensure_partitions(config.partitions)
            .await
            .context("error ensuring topic partitions")?;

        // Spawn the lock manager & subscribe all local members.
        let (manager, manager_handle) = LockManager::start(config.clone(), Arc::new(store.clone()), shutdown_tx.clone());
        let group = Arc::new(config.group.clone());
        let mut members = Vec::with_capacity(config.local_members as usize);
        for idx in 0..config.local_members {
            let name = format!("{}-{}", config.group, idx);
            let member = ConsumerMember::new(
                config.clone(),
                name.clone(),
                group.clone(),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(LoggingConsumer { member: name.clone() }),
                shutdown_tx.clone(),
            );
            let id = manager
                .subscribe(&config.group, Arc::new(member.clone()))
                .await
                .with_context(|| format!("error subscribing member {} to lock group", name))?;
            tracing::info!(member = %name, %id, group = %config.group, "consumer member subscribed");
            members.push((id, member));
        }

        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            config,
            _db: db,
            _store: store,
            manager,
            members,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            manager_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        let graceful = loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    break true;
                }
                _ = self.shutdown_rx.next() => break false,
            }
        };

        // Begin shutdown routine. Members leave their group first, and the group releases
        // their leases, which stops their readers & commits their cursors. Any reader still
        // running after that is stopped directly.
        tracing::debug!("hadron lease is shutting down");
        if graceful {
            for (id, member) in self.members.iter() {
                if let Err(err) = self.manager.unsubscribe(&self.config.group, *id).await {
                    tracing::error!(error = ?err, member = member.name(), "error unsubscribing member from lock group");
                }
            }
            let timeout = self.config.lock_ack_timeout();
            if tokio::time::timeout(timeout, self.await_group_released()).await.is_err() {
                tracing::warn!(?timeout, group = %self.config.group, "timeout waiting for lock group to release all leases");
            }
        }
        for (_, member) in self.members.iter() {
            if let Err(err) = member.stop_all().await {
                tracing::error!(error = ?err, member = member.name(), "error stopping member partition readers");
            }
        }
        let _ = self.shutdown_tx.send(());

        if let Err(err) = self.manager_handle.await.context("error joining lock manager handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down lock manager");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        tracing::debug!("hadron lease shutdown");
        Ok(())
    }

    /// Wait until this process's lock group has been discarded, which happens once every
    /// lease of its departed members has been released.
    async fn await_group_released(&self) {
        let mut interval = tokio::time::interval(GROUP_RELEASE_POLL);
        loop {
            interval.tick().await;
            match self.manager.assignment(&self.config.group).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = ?err, "error fetching lock group assignment during shutdown");
                    break;
                }
            }
        }
    }
}
