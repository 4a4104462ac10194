use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{KvStore, StoreError, Table};

pub const NAMESPACE: &str = "feedback";

/// Free-form feedback texted in by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub phone: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FeedbackLog {
    table: Table<Feedback>,
}

impl FeedbackLog {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            table: Table::new(store, NAMESPACE),
        }
    }

    pub async fn add(&self, phone: &str, message: &str) -> Result<(), StoreError> {
        let entry = Feedback {
            phone: phone.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        };
        let key = format!(
            "{:013}|{}",
            entry.at.timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );
        self.table.put(&key, &entry).await
    }

    /// Every entry, oldest first.
    pub async fn all(&self) -> Result<Vec<Feedback>, StoreError> {
        Ok(self.table.all().await?.into_iter().map(|(_, f)| f).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn entries_keep_arrival_order() {
        let log = FeedbackLog::new(Arc::new(MemoryStore::new()));
        log.add("+15550001111", "love it").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        log.add("+15550002222", "too slow").await.unwrap();

        let all = log.all().await.unwrap();
        let messages: Vec<&str> = all.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, ["love it", "too slow"]);
        assert_eq!(all[0].phone, "+15550001111");
    }
}
