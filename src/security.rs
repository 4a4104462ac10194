use std::num::NonZeroU32;

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

static ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

const ITERATIONS: NonZeroU32 = match NonZeroU32::new(200_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// How the phrase was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhraseMethod {
    Speech,
    Dtmf,
    Text,
}

/// Salted PBKDF2 hash of an account's security phrase. Hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseRecord {
    pub salt: String,
    pub hash: String,
    pub method: PhraseMethod,
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("security phrase is empty")]
    Empty,
    #[error("system random source unavailable")]
    Random,
    #[error("hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// [`PhraseRecord::create`] off the async worker threads; PBKDF2 is slow on purpose.
pub async fn hash_phrase(phrase: &str, method: PhraseMethod) -> Result<PhraseRecord, SecurityError> {
    let phrase = phrase.to_string();
    tokio::task::spawn_blocking(move || PhraseRecord::create(&phrase, method)).await?
}

/// [`PhraseRecord::verify`] off the async worker threads.
pub async fn check_phrase(record: &PhraseRecord, phrase: &str) -> bool {
    let record = record.clone();
    let phrase = phrase.to_string();
    tokio::task::spawn_blocking(move || record.verify(&phrase))
        .await
        .unwrap_or(false)
}

impl PhraseRecord {
    pub fn create(phrase: &str, method: PhraseMethod) -> Result<Self, SecurityError> {
        let phrase = normalize(phrase);
        if phrase.is_empty() {
            return Err(SecurityError::Empty);
        }

        let mut salt = [0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| SecurityError::Random)?;

        let mut hash = [0u8; HASH_LEN];
        pbkdf2::derive(ALGORITHM, ITERATIONS, &salt, phrase.as_bytes(), &mut hash);

        Ok(Self {
            salt: hex::encode(salt),
            hash: hex::encode(hash),
            method,
        })
    }

    /// Constant-time check of `phrase` against the stored hash.
    /// A malformed record never verifies.
    pub fn verify(&self, phrase: &str) -> bool {
        let phrase = normalize(phrase);
        if phrase.is_empty() {
            return false;
        }
        let (Ok(salt), Ok(expected)) = (hex::decode(&self.salt), hex::decode(&self.hash)) else {
            return false;
        };
        pbkdf2::verify(ALGORITHM, ITERATIONS, &salt, phrase.as_bytes(), &expected).is_ok()
    }
}

/// Speech recognition and keypads disagree on case and punctuation;
/// compare phrases on lowercase words only.
fn normalize(phrase: &str) -> String {
    phrase
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
