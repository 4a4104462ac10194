use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{KvStore, StoreError, Table};

pub const NAMESPACE: &str = "jobs";

/// Terminal outcome of a reply job. A job with no stored result is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    /// Synthesized audio, as a path relative to the public base URL.
    Ready { audio_ref: String },
    /// Synthesis failed; the reply is read out with `<Say>` instead.
    ReadyText { text: String },
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} already has a result")]
    AlreadyPublished(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Job results keyed by single-use job id.
///
/// Exactly one writer per id: [`JobStore::publish`] refuses a second write.
/// Reads never block; the polling endpoint just asks again later.
#[derive(Clone)]
pub struct JobStore {
    table: Table<JobResult>,
}

impl JobStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            table: Table::new(store, NAMESPACE),
        }
    }

    pub fn new_job_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub async fn publish(&self, job_id: &str, result: &JobResult) -> Result<(), JobError> {
        if self.table.put_if_absent(job_id, result).await? {
            Ok(())
        } else {
            Err(JobError::AlreadyPublished(job_id.to_string()))
        }
    }

    /// `None` while the job is still running (or if its result cannot be read).
    pub async fn get(&self, job_id: &str) -> Option<JobResult> {
        match self.table.get(job_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(job_id, "Job result unreadable: {e}");
                None
            }
        }
    }

    pub async fn exists(&self, job_id: &str) -> bool {
        self.table.exists(job_id).await.unwrap_or(false)
    }
}
