use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{KvStore, Table};

pub const NAMESPACE: &str = "calls";

/// Most recent silence warning issued since the caller last spoke.
///
/// Ordered by escalation: a later stage compares greater than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningStage {
    #[default]
    None,
    Fifteen,
    Ten,
    Five,
}

impl WarningStage {
    pub fn seconds_left(self) -> Option<u32> {
        match self {
            WarningStage::None => None,
            WarningStage::Fifteen => Some(15),
            WarningStage::Ten => Some(10),
            WarningStage::Five => Some(5),
        }
    }
}

/// Per-call metadata that survives between webhook requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallState {
    pub last_activity: DateTime<Utc>,
    pub warning_stage: WarningStage,
    pub greeted: bool,
    pub verified: bool,
    /// Account whose phrase was checked; differs from the caller on shared lines.
    pub verify_owner: Option<String>,
    pub verify_attempts: u32,
    /// Owner of a paused account has been texted about this call.
    pub owner_notified: bool,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            last_activity: Utc::now(),
            warning_stage: WarningStage::None,
            greeted: false,
            verified: false,
            verify_owner: None,
            verify_attempts: 0,
            owner_notified: false,
        }
    }
}

impl CallState {
    /// Record caller activity at `now`. Never moves `last_activity` backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
        self.warning_stage = WarningStage::None;
    }
}

/// Call state keyed by call sid.
///
/// Failures never reach the caller: a failed read is a fresh call, a failed
/// write is a no-op. Both are logged.
#[derive(Clone)]
pub struct CallStateStore {
    table: Table<CallState>,
}

impl CallStateStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            table: Table::new(store, NAMESPACE),
        }
    }

    pub async fn get(&self, call_sid: &str) -> CallState {
        self.load(call_sid).await.unwrap_or_default()
    }

    async fn load(&self, call_sid: &str) -> Option<CallState> {
        match self.table.get(call_sid).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(call_sid, "Call state unreadable, using defaults: {e}");
                None
            }
        }
    }

    pub async fn put(&self, call_sid: &str, state: &CallState) {
        if call_sid.is_empty() {
            return;
        }
        if let Err(e) = self.table.put(call_sid, state).await {
            tracing::warn!(call_sid, "Call state write dropped: {e}");
        }
    }

    /// Persist defaults for a call seen for the first time, so the watchdog
    /// measures silence from now rather than from each read.
    pub async fn ensure_started(&self, call_sid: &str) -> CallState {
        match self.load(call_sid).await {
            Some(state) => state,
            None => {
                let state = CallState::default();
                self.put(call_sid, &state).await;
                state
            }
        }
    }

    pub async fn touch_activity(&self, call_sid: &str) {
        self.update(call_sid, |s| s.touch(Utc::now())).await;
    }

    pub async fn mark_greeted(&self, call_sid: &str) {
        self.update(call_sid, |s| {
            s.greeted = true;
            s.touch(Utc::now());
        })
        .await;
    }

    pub async fn set_warning(&self, call_sid: &str, stage: WarningStage) {
        self.update(call_sid, |s| s.warning_stage = stage).await;
    }

    pub async fn mark_verified(&self, call_sid: &str, owner: &str) {
        self.update(call_sid, |s| {
            s.verified = true;
            s.verify_owner = Some(owner.to_string());
            s.verify_attempts = 0;
        })
        .await;
    }

    /// Count a failed verification. Returns the number of failures so far.
    pub async fn record_failed_verification(&self, call_sid: &str) -> u32 {
        self.update(call_sid, |s| s.verify_attempts += 1)
            .await
            .verify_attempts
    }

    pub async fn mark_owner_notified(&self, call_sid: &str) {
        self.update(call_sid, |s| s.owner_notified = true).await;
    }

    // Read-modify-write. Turns for one call are sequential, so no lock is needed.
    async fn update(&self, call_sid: &str, f: impl FnOnce(&mut CallState)) -> CallState {
        let mut state = self.get(call_sid).await;
        f(&mut state);
        self.put(call_sid, &state).await;
        state
    }
}
