//! POST /sms: text message commands, onboarding and LLM replies.

use std::panic::AssertUnwindSafe;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;

use super::outbound::{chunk_message, send_in_background, SMS_CHUNK_CHARS};
use super::{TwilioForm, Webhook};
use crate::billing::DEFAULT_PLAN;
use crate::onboarding::{self, Channel, Line};
use crate::security::{self, PhraseMethod};
use crate::twiml::Twiml;
use crate::voice::TurnError;
use crate::{voices, AppState};

const SORRY: &str = "Sorry, something went wrong. Please try again.";

pub async fn handle_sms(State(state): State<AppState>, Webhook(form): Webhook) -> Response {
    reply(&state, &form).await
}

/// Answer one inbound text with a `<Message>` document. Never fails.
pub async fn reply(state: &AppState, form: &TwilioForm) -> Response {
    state.metrics.sms_requests.inc();
    let text = match AssertUnwindSafe(respond_to(state, form)).catch_unwind().await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(from = %form.from, "SMS handling failed: {e}");
            SORRY.to_string()
        }
        Err(_) => {
            tracing::error!(from = %form.from, "SMS handler panicked");
            SORRY.to_string()
        }
    };

    let mut doc = Twiml::new();
    if !text.is_empty() {
        doc.message(text);
    }
    doc.into_response()
}

async fn respond_to(state: &AppState, form: &TwilioForm) -> Result<String, TurnError> {
    let body = form.body.trim();
    let from = form.from.as_str();
    let lower = body.to_lowercase();
    tracing::info!(from, len = body.len(), "SMS received");

    if matches!(lower.as_str(), "voice list" | "voices" | "voice help") {
        return Ok(voice_list(state));
    }
    if let Some(keyword) = strip_command(body, &["upgrade voice", "voice"]) {
        if keyword.is_empty() {
            return Ok("Please specify a voice keyword. Try 'voice list'.".into());
        }
        state.accounts.set_voice(from, keyword).await?;
        return Ok(format!("Voice set to '{keyword}'."));
    }

    let is_pay = matches!(
        lower.split_whitespace().next(),
        Some("pay" | "payment" | "subscribe")
    );
    if state.config.is_onboarding_line(&form.to) {
        if let Some(reply) = state.onboarding.handle(from, body).await? {
            return Ok(onboarding::prompt_text(&reply, Channel::Sms));
        }
        if !is_pay && !onboarding::is_trigger(body) {
            let reply = state.onboarding.start(from, Line::Onboarding).await?;
            return Ok(onboarding::prompt_text(&reply, Channel::Sms));
        }
    }

    if let Some(code) = strip_command(body, &["facility"]) {
        if code.is_empty() {
            return Ok("Usage: FACILITY <code>".into());
        }
        return Ok(match state.accounts.set_facility(from, code).await {
            Ok(()) => {
                tracing::info!(from, code, "Facility set");
                format!("Facility set to {code}.")
            }
            Err(e) => {
                tracing::warn!(from, "Facility not saved: {e}");
                "Could not set facility. Please try again.".into()
            }
        });
    }

    if let Some(phrase) = strip_command(body, &["set pass", "set password"]) {
        if phrase.is_empty() {
            return Ok("Usage: SET PASS <your phrase>".into());
        }
        let record = security::hash_phrase(phrase, PhraseMethod::Text).await?;
        state.accounts.set_security_phrase(from, record).await?;
        return Ok("Security phrase saved.".into());
    }
    if let Some(phrase) = strip_command(body, &["verify pass", "verify password"]) {
        let account = state.accounts.by_phone(from).await?;
        let ok = match account.and_then(|a| a.security_phrase) {
            Some(record) if !phrase.is_empty() => security::check_phrase(&record, phrase).await,
            _ => false,
        };
        return Ok(format!("Security check: {}", if ok { "Pass" } else { "Fail" }));
    }

    if onboarding::is_trigger(body) {
        let line = if state.config.is_onboarding_line(&form.to) {
            Line::Onboarding
        } else {
            Line::Main
        };
        let reply = state.onboarding.start(from, line).await?;
        return Ok(onboarding::prompt_text(&reply, Channel::Sms));
    }
    if let Some(reply) = state.onboarding.handle(from, body).await? {
        return Ok(onboarding::prompt_text(&reply, Channel::Sms));
    }

    if let Some(message) = strip_command(body, &["feedback"]) {
        if message.is_empty() {
            return Ok("Usage: FEEDBACK <your message>".into());
        }
        return Ok(match state.feedback.add(from, message).await {
            Ok(()) => "Thanks for the feedback! We appreciate it.".into(),
            Err(e) => {
                tracing::warn!(from, "Feedback not saved: {e}");
                "Could not save feedback. Please try again.".into()
            }
        });
    }

    if is_pay {
        return Ok(payment_link(state, from, &lower).await);
    }

    if body.is_empty() {
        return Ok("Send me a message and I'll reply.".into());
    }
    Ok(llm_reply(state, form, body).await)
}

/// `body` minus a leading command, matched case-insensitively on whole words.
fn strip_command<'a>(body: &'a str, commands: &[&str]) -> Option<&'a str> {
    commands.iter().find_map(|cmd| {
        let head = body.get(..cmd.len())?;
        if !head.eq_ignore_ascii_case(cmd) {
            return None;
        }
        let rest = &body[cmd.len()..];
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            Some(rest.trim())
        } else {
            None
        }
    })
}

fn voice_list(state: &AppState) -> String {
    let keywords = voices::keywords(&state.config);
    if keywords.is_empty() {
        return "No voices are configured yet.".into();
    }
    let mut lines = vec!["Available voices:".to_string()];
    lines.extend(keywords.iter().map(|k| format!("- {k}")));
    lines.join("\n")
}

/// `pay [plan] [crypto]`
async fn payment_link(state: &AppState, from: &str, lower: &str) -> String {
    let parts: Vec<&str> = lower.split_whitespace().collect();
    let plan = parts.get(1).copied().unwrap_or(DEFAULT_PLAN);
    let crypto = parts.get(2) == Some(&"crypto");

    match state.checkout.create_checkout(from, plan, crypto).await {
        Ok(url) => format!("Here is your secure payment link: {url}"),
        Err(e) => {
            tracing::warn!(from, plan, "Payment link failed: {e}");
            "Sorry, I could not generate a payment link.".into()
        }
    }
}

/// First part goes back in the TwiML reply; the rest follows over the REST API.
async fn llm_reply(state: &AppState, form: &TwilioForm, body: &str) -> String {
    let reply = match state.replies.text_reply(&form.from, body).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(from = %form.from, "SMS reply failed: {e}");
            return "Sorry, I couldn't process that right now.".into();
        }
    };

    let parts = chunk_message(&reply, SMS_CHUNK_CHARS);
    let Some((first, rest)) = parts.split_first() else {
        return String::new();
    };
    if !rest.is_empty() {
        send_in_background(state.sms.clone(), form.from.clone(), rest.join(" "));
    }
    if !first.is_empty() {
        state.metrics.sms_replies.inc();
    }
    first.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeLlm, Harness, MAIN_LINE, ONBOARDING_LINE};

    const TEXTER: &str = "+15550002222";

    fn sms(to: &str, body: &str) -> Vec<(&'static str, String)> {
        vec![
            ("MessageSid", "SM1".to_string()),
            ("From", TEXTER.to_string()),
            ("To", to.to_string()),
            ("Body", body.to_string()),
        ]
    }

    #[test]
    fn strip_command_needs_word_boundary() {
        assert_eq!(strip_command("Voice sparkles", &["voice"]), Some("sparkles"));
        assert_eq!(strip_command("voice", &["voice"]), Some(""));
        assert_eq!(strip_command("voicemail please", &["voice"]), None);
        assert_eq!(
            strip_command("Upgrade Voice sparkles", &["upgrade voice", "voice"]),
            Some("sparkles")
        );
        assert_eq!(
            strip_command("SET PASSWORD open sesame", &["set pass", "set password"]),
            Some("open sesame")
        );
    }

    #[tokio::test]
    async fn voice_keyword_is_stored() {
        let h = Harness::new();
        let xml = h.post("/sms", &sms(MAIN_LINE, "voice Sparkles")).await;
        assert!(xml.contains("Voice set to &apos;Sparkles&apos;."));
        assert_eq!(h.account(TEXTER).await.unwrap().voice.as_deref(), Some("Sparkles"));
    }

    #[tokio::test]
    async fn upgrade_voice_is_an_alias() {
        let h = Harness::new();
        let xml = h.post("/sms", &sms(MAIN_LINE, "upgrade voice joanna")).await;
        assert!(xml.contains("Voice set to &apos;joanna&apos;."));
        assert_eq!(h.account(TEXTER).await.unwrap().voice.as_deref(), Some("joanna"));
    }

    #[tokio::test]
    async fn facility_code_creates_or_updates_account() {
        let h = Harness::new();
        let xml = h.post("/sms", &sms(MAIN_LINE, "facility NORTH-7")).await;
        assert!(xml.contains("Facility set to NORTH-7."));
        assert_eq!(
            h.account(TEXTER).await.unwrap().facility_code.as_deref(),
            Some("NORTH-7")
        );

        h.post("/sms", &sms(MAIN_LINE, "Facility SOUTH-2")).await;
        assert_eq!(
            h.account(TEXTER).await.unwrap().facility_code.as_deref(),
            Some("SOUTH-2")
        );
        let usage = h.post("/sms", &sms(MAIN_LINE, "facility")).await;
        assert!(usage.contains("Usage: FACILITY"));
    }

    #[tokio::test]
    async fn feedback_is_stored_and_acknowledged() {
        let h = Harness::with_llm(FakeLlm::replying("unused"));
        let xml = h.post("/sms", &sms(MAIN_LINE, "feedback the hold message is too long")).await;
        assert!(xml.contains("Thanks for the feedback! We appreciate it."));

        let stored = h.state.feedback.all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].phone, TEXTER);
        assert_eq!(stored[0].message, "the hold message is too long");
        assert!(h.llm.last_messages().await.is_empty());
    }

    #[tokio::test]
    async fn counters_track_texts_replies_and_starts() {
        let h = Harness::with_llm(FakeLlm::replying("Hi there."));
        h.post("/sms", &sms(MAIN_LINE, "hello")).await;
        h.post("/sms", &sms(ONBOARDING_LINE, "hi")).await;
        h.post("/sms", &sms(MAIN_LINE, "voice list")).await;

        let metrics = &h.state.metrics;
        assert_eq!(metrics.sms_requests.get(), 3);
        assert_eq!(metrics.sms_replies.get(), 1);
        assert_eq!(metrics.onboarding_starts.get(), 1);

        let text = h.get("/metrics").await;
        assert!(text.contains("aicon_sms_requests_total 3"));
    }

    #[tokio::test]
    async fn onboard_path_is_the_unified_webhook() {
        let h = Harness::new();
        let xml = h.post("/onboard", &sms(ONBOARDING_LINE, "hello")).await;
        assert!(xml.contains("Do you already have an account?"));
        assert!(h.state.onboarding.state(TEXTER).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn voice_list_names_keywords() {
        let h = Harness::new();
        let xml = h.post("/sms", &sms(MAIN_LINE, "voice list")).await;
        assert!(xml.contains("- joanna"));
    }

    #[tokio::test]
    async fn onboarding_over_sms_matches_voice_steps() {
        let h = Harness::new();
        let first = h.post("/sms", &sms(ONBOARDING_LINE, "hello")).await;
        assert!(first.contains("Do you already have an account?"));
        let name = h.post("/sms", &sms(ONBOARDING_LINE, "nope")).await;
        assert!(name.contains("What&apos;s your full name?"));
        h.post("/sms", &sms(ONBOARDING_LINE, "Ana Lee")).await;
        h.post("/sms", &sms(ONBOARDING_LINE, "Z-991")).await;
        let done = h.post("/sms", &sms(ONBOARDING_LINE, "none")).await;
        assert!(done.contains("All set!"));
        assert_eq!(
            h.account(TEXTER).await.unwrap().prison_id.as_deref(),
            Some("Z-991")
        );
    }

    #[tokio::test]
    async fn security_phrase_by_text() {
        let h = Harness::new();
        let saved = h.post("/sms", &sms(MAIN_LINE, "set pass Blue Moon")).await;
        assert!(saved.contains("Security phrase saved."));
        let pass = h.post("/sms", &sms(MAIN_LINE, "verify pass blue moon")).await;
        assert!(pass.contains("Security check: Pass"));
        let fail = h.post("/sms", &sms(MAIN_LINE, "verify pass red moon")).await;
        assert!(fail.contains("Security check: Fail"));
        let usage = h.post("/sms", &sms(MAIN_LINE, "set pass")).await;
        assert!(usage.contains("Usage: SET PASS"));
    }

    #[tokio::test]
    async fn pay_parses_plan_and_crypto() {
        let h = Harness::new();
        let xml = h.post("/sms", &sms(MAIN_LINE, "Pay pro crypto")).await;
        assert!(xml.contains("https://checkout.test/+15550002222/pro?crypto"));
        let basic = h.post("/sms", &sms(MAIN_LINE, "subscribe")).await;
        assert!(basic.contains("https://checkout.test/+15550002222/basic"));
    }

    #[tokio::test]
    async fn long_llm_reply_is_split() {
        let reply = "word ".repeat(200);
        let h = Harness::with_llm(FakeLlm::replying(reply.trim()));
        let xml = h.post("/sms", &sms(MAIN_LINE, "tell me a story")).await;
        assert!(xml.contains("<Message>word word"));

        let sent = h.sms.wait_for(1).await;
        assert_eq!(sent[0].0, TEXTER);
        assert!(sent[0].1.starts_with("word"));
    }

    #[tokio::test]
    async fn unified_webhook_routes_texts() {
        let h = Harness::with_llm(FakeLlm::replying("Hi there."));
        let xml = h.post("/twilio", &sms(MAIN_LINE, "hello")).await;
        assert!(xml.contains("<Message>Hi there.</Message>"));
        assert!(!xml.contains("<Gather"));
    }

    #[tokio::test]
    async fn llm_failure_apologises() {
        let h = Harness::with_llm(FakeLlm::failing());
        let xml = h.post("/sms", &sms(MAIN_LINE, "hello")).await;
        assert!(xml.contains("couldn&apos;t process that"));
    }
}
