use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::onboarding::Channel;
use crate::store::{KvStore, StoreError, Table};

pub const NAMESPACE: &str = "interactions";

/// One completed exchange between a phone and the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub phone: String,
    pub channel: Channel,
    pub transcript: String,
    pub response: String,
    pub model: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Append-only log, keyed so that one phone's entries sort by time.
#[derive(Clone)]
pub struct InteractionLog {
    table: Table<Interaction>,
}

impl InteractionLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            table: Table::new(store, NAMESPACE),
        }
    }

    pub async fn append(&self, entry: &Interaction) -> Result<(), StoreError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let key = format!(
            "{}|{:013}|{}",
            entry.phone,
            entry.at.timestamp_millis(),
            &suffix[..8]
        );
        self.table.put(&key, entry).await
    }

    /// Up to `limit` most recent entries for `phone`, oldest first.
    pub async fn recent(&self, phone: &str, limit: usize) -> Result<Vec<Interaction>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let prefix = format!("{phone}|");
        let mut keys: Vec<String> = self
            .table
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        keys.sort();

        let skip = keys.len().saturating_sub(limit);
        let mut out = Vec::with_capacity(keys.len() - skip);
        for key in &keys[skip..] {
            match self.table.get(key).await {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, "Skipping interaction: {e}"),
            }
        }
        Ok(out)
    }
}
