//! Sub-flows reached from the turn controller: security phrases, the
//! inactive-line payment menu and the `<Pay>` callback.

use axum::extract::State;
use axum::response::Response;

use super::{ask, listen, respond, say, suspended_menu, take_payment, TurnError};
use super::{SECURITY_SET_PATH, SECURITY_VERIFY_PATH};
use crate::accounts::resolve_line_owner;
use crate::billing::DEFAULT_PLAN;
use crate::security::{self, PhraseMethod, SecurityError};
use crate::twilio::outbound::send_in_background;
use crate::twilio::{TwilioForm, Webhook};
use crate::twiml::Twiml;
use crate::AppState;

/// Failed phrase checks allowed per call before hanging up.
pub const MAX_VERIFY_ATTEMPTS: u32 = 3;

const PAY_SUCCESS: &[&str] = &["success", "successful", "succeeded"];

pub async fn handle_security_set(
    State(state): State<AppState>,
    Webhook(form): Webhook,
) -> Response {
    respond(&state.config, security_set(&state, &form)).await
}

pub async fn handle_security_verify(
    State(state): State<AppState>,
    Webhook(form): Webhook,
) -> Response {
    respond(&state.config, security_verify(&state, &form)).await
}

pub async fn handle_suspended_action(
    State(state): State<AppState>,
    Webhook(form): Webhook,
) -> Response {
    respond(&state.config, suspended_action(&state, &form)).await
}

pub async fn handle_pay_result(State(state): State<AppState>, Webhook(form): Webhook) -> Response {
    respond(&state.config, pay_result(&state, &form)).await
}

async fn security_set(state: &AppState, form: &TwilioForm) -> Result<Twiml, TurnError> {
    let config = &state.config;
    let mut doc = Twiml::new();
    let retry = "I didn't catch that. Please say your new security phrase, or enter it on your keypad.";

    let Some(phrase) = form.input() else {
        ask(config, &mut doc, SECURITY_SET_PATH, retry);
        return Ok(doc);
    };
    let method = if form.keypad_only() {
        PhraseMethod::Dtmf
    } else {
        PhraseMethod::Speech
    };

    let record = match security::hash_phrase(phrase, method).await {
        Ok(record) => record,
        Err(SecurityError::Empty) => {
            ask(config, &mut doc, SECURITY_SET_PATH, retry);
            return Ok(doc);
        }
        Err(e) => return Err(e.into()),
    };
    state.accounts.set_security_phrase(&form.from, record).await?;
    state.calls.touch_activity(&form.call_sid).await;
    tracing::info!(caller = %form.from, ?method, "Security phrase saved");

    listen(config, &mut doc, Some("Security phrase saved. What else can I do for you?"));
    Ok(doc)
}

async fn security_verify(state: &AppState, form: &TwilioForm) -> Result<Twiml, TurnError> {
    let config = &state.config;
    let call_sid = form.call_sid.as_str();
    let mut doc = Twiml::new();

    let owner = resolve_line_owner(state.accounts.as_ref(), &form.from, &form.to).await;
    let Some((owner_phone, record)) =
        owner.and_then(|a| a.security_phrase.map(|record| (a.phone, record)))
    else {
        listen(
            config,
            &mut doc,
            Some("There's no security phrase on file for this line. How can I help?"),
        );
        return Ok(doc);
    };

    let Some(phrase) = form.input() else {
        ask(
            config,
            &mut doc,
            SECURITY_VERIFY_PATH,
            "Please say your security phrase, or enter it on your keypad.",
        );
        return Ok(doc);
    };
    state.calls.touch_activity(call_sid).await;

    if security::check_phrase(&record, phrase).await {
        state.calls.mark_verified(call_sid, &owner_phone).await;
        tracing::info!(call_sid, owner = %owner_phone, "Security check passed");
        listen(config, &mut doc, Some("Security check passed. How can I help?"));
        return Ok(doc);
    }

    let failures = state.calls.record_failed_verification(call_sid).await;
    tracing::warn!(call_sid, owner = %owner_phone, failures, "Security check failed");
    if failures >= MAX_VERIFY_ATTEMPTS {
        say(
            config,
            &mut doc,
            "Security check failed too many times. Goodbye.",
        );
        doc.hangup();
    } else {
        ask(
            config,
            &mut doc,
            SECURITY_VERIFY_PATH,
            "Security check failed. Please try your phrase again.",
        );
    }
    Ok(doc)
}

async fn suspended_action(state: &AppState, form: &TwilioForm) -> Result<Twiml, TurnError> {
    let config = &state.config;
    let mut doc = Twiml::new();

    match form.digits.trim() {
        "1" => {
            let owner = resolve_line_owner(state.accounts.as_ref(), &form.from, &form.to).await;
            let account_phone = owner.map(|a| a.phone).unwrap_or_else(|| form.from.clone());
            match state
                .checkout
                .create_checkout(&account_phone, DEFAULT_PLAN, false)
                .await
            {
                Ok(url) => {
                    send_in_background(
                        state.sms.clone(),
                        form.from.clone(),
                        format!("Here is your secure payment link: {url}"),
                    );
                    tracing::info!(caller = %form.from, account = %account_phone, "Payment link texted");
                    say(
                        config,
                        &mut doc,
                        "I've texted you a secure payment link. Thank you, goodbye!",
                    );
                }
                Err(e) => {
                    tracing::warn!(caller = %form.from, "Payment link failed: {e}");
                    say(
                        config,
                        &mut doc,
                        "Sorry, I couldn't create a payment link right now. Please try again later.",
                    );
                }
            }
            doc.hangup();
        }
        "2" => {
            state.metrics.payments_started.inc();
            take_payment(config, &mut doc);
        }
        _ => suspended_menu(config, &mut doc),
    }
    Ok(doc)
}

async fn pay_result(state: &AppState, form: &TwilioForm) -> Result<Twiml, TurnError> {
    let config = &state.config;
    let mut doc = Twiml::new();

    let status = [form.result.trim(), form.payment_status.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_lowercase();

    if !PAY_SUCCESS.contains(&status.as_str()) {
        tracing::info!(caller = %form.from, %status, "Payment not completed");
        listen(
            config,
            &mut doc,
            Some("I couldn't complete the payment. You can also text pay for a secure link."),
        );
        return Ok(doc);
    }

    match resolve_line_owner(state.accounts.as_ref(), &form.from, &form.to).await {
        Some(owner) => {
            state.accounts.clear_suspension(&owner.phone).await?;
            tracing::info!(owner = %owner.phone, "Payment received, line reactivated");
        }
        None => tracing::warn!(caller = %form.from, "Payment received for unknown account"),
    }
    state.calls.touch_activity(&form.call_sid).await;
    listen(config, &mut doc, Some("Payment received. Thank you!"));
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use crate::test_support::{Harness, MAIN_LINE};

    const CALLER: &str = "+15550001111";

    fn form(sid: &str, fields: &[(&'static str, &str)]) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("CallSid", sid.to_string()),
            ("From", CALLER.to_string()),
            ("To", MAIN_LINE.to_string()),
        ];
        out.extend(fields.iter().map(|(k, v)| (*k, v.to_string())));
        out
    }

    async fn suspended_owner(h: &Harness) {
        let mut owner = Account::new("+15559990000");
        owner.assigned_number = Some(MAIN_LINE.into());
        owner.suspended = true;
        h.add_account(owner).await;
    }

    #[tokio::test]
    async fn keypad_phrase_is_saved_as_dtmf() {
        let h = Harness::new();
        let xml = h
            .post("/voice/security_set", &form("CA1", &[("Digits", "4321")]))
            .await;
        assert!(xml.contains("Security phrase saved"));
        let account = h.account(CALLER).await.unwrap();
        let record = account.security_phrase.unwrap();
        assert_eq!(record.method, PhraseMethod::Dtmf);
        assert!(record.verify("4321"));
    }

    #[tokio::test]
    async fn empty_phrase_reprompts() {
        let h = Harness::new();
        let xml = h
            .post("/voice/security_set", &form("CA1", &[("SpeechResult", "?!")]))
            .await;
        assert!(xml.contains(r#"action="/voice/security_set""#));
        assert!(h.account(CALLER).await.is_none());
    }

    #[tokio::test]
    async fn three_failures_hang_up() {
        let h = Harness::new();
        let mut account = Account::new(CALLER);
        account.security_required = true;
        account.security_phrase = Some(
            security::hash_phrase("red fox", PhraseMethod::Text)
                .await
                .unwrap(),
        );
        h.add_account(account).await;

        let verify = form("CA2", &[("SpeechResult", "blue fox")]);
        for _ in 1..MAX_VERIFY_ATTEMPTS {
            let xml = h.post("/voice/security_verify", &verify).await;
            assert!(xml.contains("Please try your phrase again"));
        }
        let last = h.post("/voice/security_verify", &verify).await;
        assert!(last.contains("<Hangup/>"));
        assert!(!h.state.calls.get("CA2").await.verified);
    }

    #[tokio::test]
    async fn no_phrase_on_file_skips_the_check() {
        let h = Harness::new();
        let xml = h
            .post("/voice/security_verify", &form("CA3", &[("SpeechResult", "anything")]))
            .await;
        assert!(xml.contains("no security phrase on file"));
    }

    #[tokio::test]
    async fn digit_one_texts_a_checkout_link() {
        let h = Harness::new();
        suspended_owner(&h).await;
        let xml = h
            .post("/voice/suspended_action", &form("CA4", &[("Digits", "1")]))
            .await;
        assert!(xml.contains("texted you a secure payment link"));
        assert!(xml.contains("<Hangup/>"));

        let sent = h.sms.wait_for(1).await;
        assert_eq!(sent[0].0, CALLER);
        assert!(sent[0].1.contains("https://checkout.test/+15559990000/basic"));
    }

    #[tokio::test]
    async fn digit_two_collects_card_and_other_digits_repeat_menu() {
        let h = Harness::new();
        suspended_owner(&h).await;
        let pay = h
            .post("/voice/suspended_action", &form("CA5", &[("Digits", "2")]))
            .await;
        assert!(pay.contains("<Pay action=\"/voice/pay_result\""));

        let again = h
            .post("/voice/suspended_action", &form("CA5", &[("Digits", "9")]))
            .await;
        assert!(again.contains("currently inactive"));
        assert_eq!(h.state.metrics.payments_started.get(), 1);
    }

    #[tokio::test]
    async fn successful_payment_reactivates_line() {
        let h = Harness::new();
        suspended_owner(&h).await;
        let xml = h
            .post("/voice/pay_result", &form("CA6", &[("Result", "success")]))
            .await;
        assert!(xml.contains("Payment received"));
        assert!(!h.account("+15559990000").await.unwrap().is_inactive());
    }

    #[tokio::test]
    async fn failed_payment_leaves_suspension() {
        let h = Harness::new();
        suspended_owner(&h).await;
        let xml = h
            .post(
                "/voice/pay_result",
                &form("CA7", &[("Result", "payment-connector-error")]),
            )
            .await;
        assert!(xml.contains("couldn&apos;t complete the payment"));
        assert!(h.account("+15559990000").await.unwrap().is_inactive());
    }
}
