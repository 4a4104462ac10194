use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::security::PhraseRecord;
use crate::store::{KvStore, StoreError, Table};

pub const NAMESPACE: &str = "accounts";

/// A subscriber account, keyed by the subscriber's own phone number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub phone: String,
    pub name: Option<String>,
    pub prison_id: Option<String>,
    /// Code entered at sign-up.
    pub affiliate_code: Option<String>,
    /// Phone of the account whose affiliate code was used at sign-up.
    pub referrer_phone: Option<String>,
    /// Per-account Twilio number other people call to reach this subscriber.
    pub assigned_number: Option<String>,
    pub suspended: bool,
    pub subscription_active: bool,
    pub usage_paused: bool,
    pub security_required: bool,
    pub security_phrase: Option<PhraseRecord>,
    /// Voice keyword or raw voice id.
    pub voice: Option<String>,
    pub facility_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            phone: String::new(),
            name: None,
            prison_id: None,
            affiliate_code: None,
            referrer_phone: None,
            assigned_number: None,
            suspended: false,
            subscription_active: true,
            usage_paused: false,
            security_required: false,
            security_phrase: None,
            voice: None,
            facility_code: None,
            created_at: Utc::now(),
        }
    }
}

impl Account {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            ..Self::default()
        }
    }

    /// Calls to this account's line are blocked until payment.
    pub fn is_inactive(&self) -> bool {
        self.suspended || !self.subscription_active
    }

    /// The phrase gate only applies when a phrase is actually on file.
    pub fn requires_phrase(&self) -> bool {
        self.security_required && self.security_phrase.is_some()
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn by_phone(&self, phone: &str) -> Result<Option<Account>, StoreError>;

    async fn by_assigned_number(&self, number: &str) -> Result<Option<Account>, StoreError>;

    async fn upsert(&self, account: &Account) -> Result<(), StoreError>;

    /// Oldest account whose affiliate code matches, ignoring case.
    async fn find_by_affiliate_code(&self, code: &str) -> Result<Option<Account>, StoreError>;

    /// Returns false when no account exists for `phone`.
    async fn clear_suspension(&self, phone: &str) -> Result<bool, StoreError> {
        let Some(mut account) = self.by_phone(phone).await? else {
            return Ok(false);
        };
        account.suspended = false;
        account.subscription_active = true;
        self.upsert(&account).await?;
        Ok(true)
    }

    /// Creates the account if it does not exist yet.
    async fn set_security_phrase(
        &self,
        phone: &str,
        record: PhraseRecord,
    ) -> Result<(), StoreError> {
        let mut account = self
            .by_phone(phone)
            .await?
            .unwrap_or_else(|| Account::new(phone));
        account.security_phrase = Some(record);
        self.upsert(&account).await
    }

    async fn set_voice(&self, phone: &str, voice: &str) -> Result<(), StoreError> {
        let mut account = self
            .by_phone(phone)
            .await?
            .unwrap_or_else(|| Account::new(phone));
        account.voice = Some(voice.to_string());
        self.upsert(&account).await
    }

    async fn set_facility(&self, phone: &str, code: &str) -> Result<(), StoreError> {
        let mut account = self
            .by_phone(phone)
            .await?
            .unwrap_or_else(|| Account::new(phone));
        account.facility_code = Some(code.to_string());
        self.upsert(&account).await
    }
}

/// Resolve the account that owns a call: the subscriber whose assigned number
/// was dialled, else the caller's own account.
pub async fn resolve_line_owner(
    accounts: &dyn AccountStore,
    caller: &str,
    callee: &str,
) -> Option<Account> {
    match lookup_line_owner(accounts, caller, callee).await {
        Ok(account) => account,
        Err(e) => {
            // Missing data skips the gates instead of failing the call.
            tracing::warn!(caller, callee, "Account lookup failed: {e}");
            None
        }
    }
}

async fn lookup_line_owner(
    accounts: &dyn AccountStore,
    caller: &str,
    callee: &str,
) -> Result<Option<Account>, StoreError> {
    if !callee.is_empty() {
        if let Some(owner) = accounts.by_assigned_number(callee).await? {
            return Ok(Some(owner));
        }
    }
    if caller.is_empty() {
        return Ok(None);
    }
    accounts.by_phone(caller).await
}

/// Accounts stored in the shared [`KvStore`].
///
/// Lookups other than by phone scan the whole namespace, which is fine at the
/// account counts this service sees.
#[derive(Clone)]
pub struct KvAccountStore {
    table: Table<Account>,
}

impl KvAccountStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            table: Table::new(store, NAMESPACE),
        }
    }
}

#[async_trait]
impl AccountStore for KvAccountStore {
    async fn by_phone(&self, phone: &str) -> Result<Option<Account>, StoreError> {
        self.table.get(phone).await
    }

    async fn by_assigned_number(&self, number: &str) -> Result<Option<Account>, StoreError> {
        Ok(self
            .table
            .all()
            .await?
            .into_iter()
            .map(|(_, a)| a)
            .find(|a| a.assigned_number.as_deref() == Some(number)))
    }

    async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        self.table.put(&account.phone, account).await
    }

    async fn find_by_affiliate_code(&self, code: &str) -> Result<Option<Account>, StoreError> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }
        Ok(self
            .table
            .all()
            .await?
            .into_iter()
            .map(|(_, a)| a)
            .filter(|a| {
                a.affiliate_code
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(code))
            })
            .min_by_key(|a| a.created_at))
    }
}
