//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};
use crate::models::PartitionId;

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/hadron/db";
/// The DB tree prefix used for topic partitions.
const TREE_TOPIC_PREFIX: &str = "topic";
/// The DB tree prefix used for topic metadata.
const TREE_TOPIC_METADATA: &str = "topic_metadata";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the Hadron database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.topic.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for hadron lease database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree of a topic partition.
    pub async fn get_partition_tree(&self, topic: &str, partition: PartitionId) -> ShutdownResult<Tree> {
        let name = format!("{}/{}/{}", TREE_TOPIC_PREFIX, topic, partition);
        self.open_tree(name).await
    }

    /// Get a handle to the DB tree of a topic's metadata.
    pub async fn get_topic_tree_metadata(&self, topic: &str) -> ShutdownResult<Tree> {
        let name = format!("{}/{}", TREE_TOPIC_METADATA, topic);
        self.open_tree(name).await
    }

    async fn open_tree(&self, name: String) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))?;
        Ok(tree)
    }
}
