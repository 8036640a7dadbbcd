//! Durable job metadata on top of [`Storage`].
//!
//! Per-job layout:
//!
//! | Key | Content |
//! |-----|---------|
//! | `jobs/{id}/job.json` | serialized [`JobRecord`] |
//! | `jobs/{id}/input/original{.ext}` | uploaded document |
//! | `jobs/{id}/output/result.md` | Markdown result |
//! | `jobs/{id}/artifacts/{name}` | extra conversion outputs |
//!
//! A record is only ever written whole through [`Storage::put`], so readers
//! always see either the previous or the new version.

use std::sync::Arc;

use docconv_core::error::CoreError;
use docconv_core::job::JobRecord;
use docconv_core::types::JobId;

use crate::storage::{Storage, StorageError};

const JOBS_PREFIX: &str = "jobs";
const RECORD_FILE: &str = "job.json";
const RESULT_FILE: &str = "result.md";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} already exists")]
    AlreadyExists(JobId),

    #[error("Corrupt job record {id}: {source}")]
    Corrupt {
        id: JobId,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::job_not_found(id.to_string()),
            StoreError::AlreadyExists(id) => CoreError::Conflict(format!("Job {id} already exists")),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

pub fn job_prefix(id: JobId) -> String {
    format!("{JOBS_PREFIX}/{id}")
}

pub fn record_key(id: JobId) -> String {
    format!("{JOBS_PREFIX}/{id}/{RECORD_FILE}")
}

/// `extension` includes the leading dot, or is empty.
pub fn input_key(id: JobId, extension: &str) -> String {
    format!("{JOBS_PREFIX}/{id}/input/original{extension}")
}

pub fn output_key(id: JobId) -> String {
    format!("{JOBS_PREFIX}/{id}/output/{RESULT_FILE}")
}

pub fn artifact_key(id: JobId, name: &str) -> String {
    format!("{JOBS_PREFIX}/{id}/artifacts/{name}")
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Keyed access to [`JobRecord`]s plus the job's byte objects.
#[derive(Clone)]
pub struct JobStore {
    storage: Arc<dyn Storage>,
}

impl JobStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Persist a brand-new record. Fails if the id is already taken.
    pub async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        let key = record_key(record.id());
        if self.storage.exists(&key).await? {
            return Err(StoreError::AlreadyExists(record.id()));
        }
        self.write(&key, record).await
    }

    /// Replace the stored record with `record`.
    pub async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.write(&record_key(record.id()), record).await
    }

    pub async fn load(&self, id: JobId) -> Result<JobRecord, StoreError> {
        let bytes = match self.storage.get(&record_key(id)).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { id, source })
    }

    /// Remove the job's record and every object under its directory.
    pub async fn discard(&self, id: JobId) -> Result<(), StoreError> {
        self.storage.delete_prefix(&job_prefix(id)).await?;
        Ok(())
    }

    /// Ids of every job directory. Entries that are not UUIDs are ignored.
    pub async fn list_ids(&self) -> Result<Vec<JobId>, StoreError> {
        let names = self.storage.list(JOBS_PREFIX).await?;
        Ok(names
            .iter()
            .filter_map(|name| name.parse::<JobId>().ok())
            .collect())
    }

    /// Every readable record. Corrupt or half-created entries are logged and
    /// skipped.
    pub async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::new();
        for id in self.list_ids().await? {
            match self.load(id).await {
                Ok(record) => records.push(record),
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(job_id = %id, "Job directory without record, skipping");
                }
                Err(e @ StoreError::Corrupt { .. }) => {
                    tracing::warn!(job_id = %id, error = %e, "Skipping unreadable job record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn write(&self, key: &str, record: &JobRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Corrupt {
            id: record.id(),
            source,
        })?;
        self.storage.put(key, &bytes).await?;
        Ok(())
    }
}
