//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::distributor::DistributorKind;

/// The default number of partitions ensured for the topic on startup.
const DEFAULT_PARTITIONS: u32 = 1;
/// The default number of in-process consumer members started on boot.
const DEFAULT_LOCAL_MEMBERS: u32 = 1;
/// The default max number of messages read per partition reader batch.
pub const DEFAULT_MAX_BATCH_SIZE: u32 = 50;
/// The default amount of time a lock listener has to acknowledge a lease transition.
pub const DEFAULT_LOCK_ACK_TIMEOUT_SECS: u64 = 30;
/// The default delay before a failed lease acknowledgement is re-issued.
pub const DEFAULT_LOCK_ACK_RETRY_SECS: u64 = 5;
const DEFAULT_READER_IDLE_MS: u64 = 250;
const DEFAULT_READER_RETRY_MS: u64 = 1000;
const DEFAULT_METRICS_PORT: u16 = 7002;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port on which the metrics server listens.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The name of the topic served by this process.
    pub topic: String,
    /// The name of the consumer group which the local members join.
    #[serde(default = "Config::default_group")]
    pub group: String,
    /// The number of partitions which the topic is ensured to have on startup.
    #[serde(default = "Config::default_partitions")]
    pub partitions: u32,
    /// The number of in-process consumer members to subscribe to the group.
    #[serde(default = "Config::default_local_members")]
    pub local_members: u32,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The partition distribution strategy used by lock groups.
    #[serde(default)]
    pub distributor: DistributorKind,
    /// The max number of messages delivered per partition reader batch.
    #[serde(default = "Config::default_max_batch_size")]
    pub max_batch_size: u32,
    /// The number of seconds a lock listener has to acknowledge a lease transition.
    #[serde(default = "Config::default_lock_ack_timeout_secs")]
    pub lock_ack_timeout_secs: u64,
    /// The number of seconds to wait before re-issuing a failed lease acknowledgement.
    ///
    /// A value of `0` disables the retry timer, in which case a stalled lease is only
    /// re-issued by the next unrelated rebalance of its group.
    #[serde(default = "Config::default_lock_ack_retry_secs")]
    pub lock_ack_retry_secs: u64,
    /// The number of milliseconds a partition reader waits when it is caught up.
    #[serde(default = "Config::default_reader_idle_ms")]
    pub reader_idle_ms: u64,
    /// The number of milliseconds a partition reader backs off after a failure.
    #[serde(default = "Config::default_reader_retry_ms")]
    pub reader_retry_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the contents of this config.
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            bail!("invalid config, TOPIC may not be empty");
        }
        if self.group.is_empty() {
            bail!("invalid config, GROUP may not be empty");
        }
        if self.max_batch_size == 0 {
            bail!("invalid config, MAX_BATCH_SIZE must be greater than 0");
        }
        Ok(())
    }

    /// The amount of time a lock listener has to acknowledge a lease transition.
    pub fn lock_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_ack_timeout_secs)
    }

    /// The delay before a failed lease acknowledgement is re-issued, if enabled.
    pub fn lock_ack_retry(&self) -> Option<Duration> {
        match self.lock_ack_retry_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn reader_idle(&self) -> Duration {
        Duration::from_millis(self.reader_idle_ms)
    }

    pub fn reader_retry(&self) -> Duration {
        Duration::from_millis(self.reader_retry_ms)
    }

    fn default_metrics_port() -> u16 {
        DEFAULT_METRICS_PORT
    }

    fn default_group() -> String {
        "default".into()
    }

    fn default_partitions() -> u32 {
        DEFAULT_PARTITIONS
    }

    fn default_local_members() -> u32 {
        DEFAULT_LOCAL_MEMBERS
    }

    fn default_max_batch_size() -> u32 {
        DEFAULT_MAX_BATCH_SIZE
    }

    fn default_lock_ack_timeout_secs() -> u64 {
        DEFAULT_LOCK_ACK_TIMEOUT_SECS
    }

    fn default_lock_ack_retry_secs() -> u64 {
        DEFAULT_LOCK_ACK_RETRY_SECS
    }

    fn default_reader_idle_ms() -> u64 {
        DEFAULT_READER_IDLE_MS
    }

    fn default_reader_retry_ms() -> u64 {
        DEFAULT_READER_RETRY_MS
    }
}

#[cfg(test)]
impl Config {
    /// Build a config suitable for tests, backed by a temporary storage directory.
    ///
    /// The returned `TempDir` must be held for as long as the storage is in use.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "error".into(),
                metrics_port: DEFAULT_METRICS_PORT,
                topic: "events".into(),
                group: "default".into(),
                partitions: 4,
                local_members: 1,
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                distributor: DistributorKind::Modulo,
                max_batch_size: DEFAULT_MAX_BATCH_SIZE,
                lock_ack_timeout_secs: 5,
                lock_ack_retry_secs: 1,
                reader_idle_ms: 10,
                reader_retry_ms: 10,
            }),
            tmpdir,
        ))
    }
}
