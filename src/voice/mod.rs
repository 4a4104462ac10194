//! Voice call webhooks.
//!
//! Every turn is stateless on our side: handlers rebuild what they need from
//! the call state and account stores, answer with TwiML, and let Twilio drive
//! the next request.

pub mod idle;
pub mod playback;
pub mod subflows;
pub mod turn;

use std::future::Future;
use std::panic::AssertUnwindSafe;

use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;

use crate::config::Config;
use crate::security::SecurityError;
use crate::store::StoreError;
use crate::twiml::{self, Gather, GatherInput, Pay, Twiml, VerbSink};

pub const VOICE_PATH: &str = "/voice";
pub const IDLE_PATH: &str = "/voice/idle";
/// Idle tick that restarts the silence clock first, used once a reply has played.
pub const IDLE_RESET_PATH: &str = "/voice/idle?reset=1";
pub const SECURITY_SET_PATH: &str = "/voice/security_set";
pub const SECURITY_VERIFY_PATH: &str = "/voice/security_verify";
pub const SUSPENDED_ACTION_PATH: &str = "/voice/suspended_action";
pub const PAY_RESULT_PATH: &str = "/voice/pay_result";

const APOLOGY: &str = "Sorry, something went wrong on my end. Let's try that again.";

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("storage failed: {0}")]
    Store(#[from] StoreError),
    #[error("security phrase handling failed: {0}")]
    Security(#[from] SecurityError),
}

/// Render a turn so that Twilio always receives valid TwiML.
///
/// An error becomes a spoken apology that keeps listening; a panic becomes
/// the static [`twiml::FALLBACK`] document.
pub async fn respond<F>(config: &Config, turn: F) -> Response
where
    F: Future<Output = Result<Twiml, TurnError>>,
{
    match AssertUnwindSafe(turn).catch_unwind().await {
        Ok(Ok(doc)) => doc.into_response(),
        Ok(Err(e)) => {
            tracing::warn!("Turn failed, apologising: {e}");
            apology(config).into_response()
        }
        Err(_) => {
            tracing::error!("Turn panicked, sending fallback TwiML");
            ([(CONTENT_TYPE, "text/xml")], twiml::FALLBACK).into_response()
        }
    }
}

pub fn apology(config: &Config) -> Twiml {
    let mut doc = Twiml::new();
    listen(config, &mut doc, Some(APOLOGY));
    doc
}

/// Gather the caller's next utterance, speaking `prompt` first.
/// Silence falls through to the watchdog.
pub fn listen(config: &Config, doc: &mut Twiml, prompt: Option<&str>) {
    listen_for(config, doc, prompt, config.voice.gather_timeout_secs);
}

pub fn listen_for(config: &Config, doc: &mut Twiml, prompt: Option<&str>, timeout: u32) {
    gather_then(config, doc, prompt, timeout, IDLE_PATH);
}

/// Like [`listen`], for the turn that delivers a reply. The reply's playback
/// time does not count as silence.
pub fn listen_after_reply(config: &Config, doc: &mut Twiml, prompt: Option<&str>) {
    gather_then(
        config,
        doc,
        prompt,
        config.voice.gather_timeout_secs,
        IDLE_RESET_PATH,
    );
}

fn gather_then(config: &Config, doc: &mut Twiml, prompt: Option<&str>, timeout: u32, idle: &str) {
    let mut gather = Gather::new(GatherInput::SpeechDtmf, VOICE_PATH, timeout);
    if let Some(text) = prompt {
        gather.say(text, &config.voice.say_voice);
    }
    doc.gather(gather);
    doc.redirect(idle);
}

/// Prompt, then send whatever is said or keyed to `action`.
pub fn ask(config: &Config, doc: &mut Twiml, action: &str, prompt: &str) {
    let mut gather = Gather::new(
        GatherInput::SpeechDtmf,
        action,
        config.voice.gather_timeout_secs,
    );
    gather.say(prompt, &config.voice.say_voice);
    doc.gather(gather);
    doc.redirect(IDLE_PATH);
}

pub fn say(config: &Config, doc: &mut Twiml, text: &str) {
    doc.say(text, &config.voice.say_voice);
}

/// Inactive-line notice with the one-digit payment menu.
pub fn suspended_menu(config: &Config, doc: &mut Twiml) {
    let mut gather = Gather::new(
        GatherInput::Dtmf,
        SUSPENDED_ACTION_PATH,
        config.voice.gather_timeout_secs,
    )
    .num_digits(1);
    gather.say(
        "The number you have reached is currently inactive. \
         Press 1 to get a payment link by text, or press 2 to pay now by phone.",
        &config.voice.say_voice,
    );
    doc.gather(gather);
    doc.redirect(IDLE_PATH);
}

/// Twilio-native card capture; the outcome is posted to [`PAY_RESULT_PATH`].
pub fn take_payment(config: &Config, doc: &mut Twiml) {
    say(config, doc, "Okay, let's take your payment now.");
    doc.pay(Pay {
        action: PAY_RESULT_PATH.to_string(),
        connector: config.twilio.pay_connector.clone(),
        prompts: vec![
            (
                "payment-card-number".into(),
                "Please enter or say your card number.".into(),
            ),
            (
                "expiration-date".into(),
                "Please say the expiration date, month and year.".into(),
            ),
            ("security-code".into(), "Please say the security code.".into()),
            (
                "postal-code".into(),
                "Please say your billing postal code.".into(),
            ),
        ],
    });
}
