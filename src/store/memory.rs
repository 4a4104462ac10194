use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{KvStore, Record, StoreError};

/// Process-local store. Only correct for a single server process; used in tests
/// and for quick local runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<(String, String), Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn slot(namespace: &str, key: &str) -> (String, String) {
    (namespace.to_string(), key.to_string())
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.inner.lock().await.get(&slot(namespace, key)).cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: String) -> Result<(), StoreError> {
        self.inner.lock().await.insert(
            slot(namespace, key),
            Record {
                value,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: String,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = slot(namespace, key);
        if inner.contains_key(&slot) {
            return Ok(false);
        }
        inner.insert(
            slot,
            Record {
                value,
                updated_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .remove(&slot(namespace, key))
            .is_some())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_older_than(
        &self,
        namespace: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|(ns, _), record| ns != namespace || record.updated_at >= cutoff);
        Ok(before - inner.len())
    }
}
