//! Where finished jobs are kept.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    shared::JobResult,
};

/// A finished job, as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    /// The program which ran.
    pub name: String,

    /// The overall result.
    pub status: JobResult,

    /// Arguments, per-device results, metadata and the last error.
    pub data: serde_json::Value,
}

/// Persistence for finished jobs.
#[async_trait]
pub trait JobStore: Send + Sync + Debug {
    /// Store a job of the meter known by `db_id`, along with its log.
    async fn insert(&self, db_id: i64, record: JobRecord, log: String) -> Result<()>;
}

/// A stored job and its log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    /// See [`JobRecord`].
    pub record: JobRecord,

    /// The job log.
    pub log: String,
}

/// Keeps jobs in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<i64, Vec<StoredJob>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The jobs stored for a meter, oldest first.
    pub fn jobs(&self, db_id: i64) -> Vec<StoredJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&db_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, db_id: i64, record: JobRecord, log: String) -> Result<()> {
        debug!(db_id, name = %record.name, "Storing job");

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(db_id)
            .or_default()
            .push(StoredJob { record, log });

        Ok(())
    }
}

/// Writes each job to `<root>/<db id>/<uuid>.json`, with its log next to it as `<uuid>.log`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Store jobs under `root`. It is created when needed.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl JobStore for DirectoryStore {
    async fn insert(&self, db_id: i64, record: JobRecord, log: String) -> Result<()> {
        let store_error = |e: std::io::Error| Error::Store(e.to_string());

        let dir = self.root.join(db_id.to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(store_error)?;

        let id = Uuid::new_v4();
        let json = serde_json::to_string_pretty(&record).map_err(|e| Error::Store(e.to_string()))?;

        tokio::fs::write(dir.join(format!("{id}.json")), json)
            .await
            .map_err(store_error)?;
        tokio::fs::write(dir.join(format!("{id}.log")), log)
            .await
            .map_err(store_error)?;

        info!(db_id, %id, name = %record.name, "Stored job");
        Ok(())
    }
}
