use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

const VARIANTS: &[&str] = &[
    "Hey, it's {name}. What's on your mind today?",
    "Hi! {name} here. How can I help?",
    "Hey there, {name} is ready to jump in whenever you are!",
    "It's {name}. What should we tackle first?",
];

/// A caller keeps the same greeting for this long before it rotates.
const ROTATION_WINDOW_SECS: i64 = 60 * 60;

const ONBOARDING_INTRO: &str = "Welcome to {name}! I can get you set up in about a minute. \
     Do you already have an account?";

/// Select a greeting for `caller`.
///
/// Configured greetings go ahead of the built-in variants. The choice is a
/// stable hash of the caller and the current rotation window, so a caller who
/// rings back shortly after hears the same opener.
pub fn select_greeting(caller: &str, name: &str, extra: &[String], now: DateTime<Utc>) -> String {
    let mut pool: Vec<&str> = Vec::with_capacity(extra.len() + VARIANTS.len());
    pool.extend(extra.iter().map(String::as_str).filter(|g| !g.trim().is_empty()));
    pool.extend_from_slice(VARIANTS);

    let window = now.timestamp().div_euclid(ROTATION_WINDOW_SECS) as u64;
    let idx = (stable_hash(caller).wrapping_add(window) % pool.len() as u64) as usize;
    pool[idx].replace("{name}", name)
}

/// Opening prompt on the dedicated sign-up line.
pub fn onboarding_greeting(name: &str) -> String {
    ONBOARDING_INTRO.replace("{name}", name)
}

fn stable_hash(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(first)
}
