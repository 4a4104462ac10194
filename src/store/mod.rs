//! Shared key/value storage.
//!
//! Every piece of cross-request state (call state, job results, onboarding
//! progress, accounts) goes through [`KvStore`], so webhook turns handled by
//! different requests or workers see each other's writes.

mod file;
mod memory;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use file::FileStore;
pub use memory::MemoryStore;

/// A stored value with the time it was last written.
#[derive(Debug, Clone)]
pub struct Record {
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>, StoreError>;

    /// Overwrite `key` unconditionally.
    async fn put(&self, namespace: &str, key: &str, value: String) -> Result<(), StoreError>;

    /// Write `key` only if it does not exist yet. Returns whether the write happened.
    async fn put_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: String,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError>;

    /// Remove every record in `namespace` last written before `cutoff`.
    async fn purge_older_than(
        &self,
        namespace: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored record {key} is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("failed to encode record: {0}")]
    Encode(String),
}

/// Typed view over one namespace of a [`KvStore`], JSON encoded.
pub struct Table<T> {
    store: Arc<dyn KvStore>,
    namespace: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace,
            _marker: PhantomData,
        }
    }
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn KvStore>, namespace: &'static str) -> Self {
        Self {
            store,
            namespace,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(self.namespace, key).await? {
            Some(record) => decode(key, &record.value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.store.put(self.namespace, key, encode(value)?).await
    }

    pub async fn put_if_absent(&self, key: &str, value: &T) -> Result<bool, StoreError> {
        self.store
            .put_if_absent(self.namespace, key, encode(value)?)
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.store.delete(self.namespace, key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(self.namespace, key).await?.is_some())
    }

    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.store.keys(self.namespace).await
    }

    /// Every readable record in the namespace. Unreadable records are skipped.
    pub async fn all(&self) -> Result<Vec<(String, T)>, StoreError> {
        let mut out = Vec::new();
        for key in self.keys().await? {
            match self.get(&key).await {
                Ok(Some(v)) => out.push((key, v)),
                Ok(None) => {}
                Err(e) => tracing::warn!(namespace = self.namespace, key = %key, "Skipping record: {e}"),
            }
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Retention rule for one namespace.
#[derive(Debug, Clone)]
pub struct Retention {
    pub namespace: &'static str,
    pub max_age: Duration,
}

/// Periodically purge expired records until `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<dyn KvStore>,
    rules: Vec<Retention>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Sweeper stopped");
                    return;
                }
                _ = interval.tick() => {
                    sweep_once(store.as_ref(), &rules).await;
                }
            }
        }
    })
}

/// Wait for a stopped sweeper. A failed task is logged, never propagated.
pub async fn join_sweeper(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Sweeper task failed: {e}");
            false
        }
    }
}

pub async fn sweep_once(store: &dyn KvStore, rules: &[Retention]) -> usize {
    let mut total = 0;
    for rule in rules {
        let max_age = chrono::Duration::from_std(rule.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match store.purge_older_than(rule.namespace, cutoff).await {
            Ok(0) => {}
            Ok(n) => {
                tracing::info!(namespace = rule.namespace, purged = n, "Expired records purged");
                total += n;
            }
            Err(e) => tracing::warn!(namespace = rule.namespace, "Sweep failed: {e}"),
        }
    }
    total
}
