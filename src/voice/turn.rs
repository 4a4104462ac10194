//! POST /voice: the per-turn decision function.

use axum::extract::State;
use axum::response::Response;
use chrono::Utc;

use super::{ask, listen, say, suspended_menu, take_payment, respond, TurnError};
use super::{IDLE_PATH, SECURITY_SET_PATH, SECURITY_VERIFY_PATH};
use crate::accounts::{resolve_line_owner, Account};
use crate::greeting;
use crate::onboarding::{self, Channel, Line, Opening, Reply};
use crate::pipeline::ReplyRequest;
use crate::session::{CallState, JobStore};
use crate::twilio::outbound::send_in_background;
use crate::twilio::{TwilioForm, Webhook};
use crate::twiml::Twiml;
use crate::AppState;

const PAY_WORDS: &[&str] = &["pay", "payment", "subscribe"];

pub async fn handle_voice(State(state): State<AppState>, Webhook(form): Webhook) -> Response {
    respond_to_turn(&state, &form).await
}

pub async fn respond_to_turn(state: &AppState, form: &TwilioForm) -> Response {
    state.metrics.voice_requests.inc();
    respond(&state.config, take_turn(state, form)).await
}

/// Gates run in a fixed order and the first one that applies answers the turn.
pub async fn take_turn(state: &AppState, form: &TwilioForm) -> Result<Twiml, TurnError> {
    let config = &state.config;
    let call_sid = form.call_sid.as_str();

    let owner = resolve_line_owner(state.accounts.as_ref(), &form.from, &form.to).await;
    let call = state.calls.ensure_started(call_sid).await;
    let mut doc = Twiml::new();

    let Some(input) = form.input() else {
        silent_turn(state, form, owner.as_ref(), &call, &mut doc).await;
        return Ok(doc);
    };

    state.calls.touch_activity(call_sid).await;

    if let Some(account) = owner.as_ref() {
        if account.requires_phrase() && !verified_for(&call, account) {
            tracing::info!(call_sid, owner = %account.phone, "Gate: security phrase");
            ask(
                config,
                &mut doc,
                SECURITY_VERIFY_PATH,
                "For security, please say or enter your security phrase.",
            );
            return Ok(doc);
        }
    }

    if let Some(reply) = onboarding_turn(state, form, input).await? {
        speak_onboarding(state, form, &reply, &mut doc);
        return Ok(doc);
    }

    let command = onboarding::normalize(input);
    if command.starts_with("set pass") {
        tracing::info!(call_sid, "Command: set security phrase");
        ask(
            config,
            &mut doc,
            SECURITY_SET_PATH,
            "Okay. Please say your new security phrase, or enter it on your keypad.",
        );
        return Ok(doc);
    }
    if command.starts_with("verify pass") {
        tracing::info!(call_sid, "Command: verify security phrase");
        ask(
            config,
            &mut doc,
            SECURITY_VERIFY_PATH,
            "Please say your security phrase now, or enter it on your keypad.",
        );
        return Ok(doc);
    }
    if PAY_WORDS.contains(&command.as_str()) {
        tracing::info!(call_sid, "Command: pay by phone");
        state.metrics.payments_started.inc();
        take_payment(config, &mut doc);
        return Ok(doc);
    }

    let job_id = JobStore::new_job_id();
    state.replies.dispatch(ReplyRequest {
        job_id: job_id.clone(),
        call_sid: call_sid.to_string(),
        caller: form.from.clone(),
        utterance: input.to_string(),
        account: owner,
    });
    doc.redirect(super::playback::play_url(&job_id, 0, false));
    Ok(doc)
}

/// No speech or digits: line gates first, then the one-time greeting.
async fn silent_turn(
    state: &AppState,
    form: &TwilioForm,
    owner: Option<&Account>,
    call: &CallState,
    doc: &mut Twiml,
) {
    if let Some(account) = owner {
        if account.is_inactive() {
            tracing::info!(call_sid = %form.call_sid, owner = %account.phone, "Gate: inactive line");
            suspended_menu(&state.config, doc);
            return;
        }
        if account.usage_paused {
            tracing::info!(call_sid = %form.call_sid, owner = %account.phone, "Gate: usage paused");
            paused_notice(state, form, account, call, doc).await;
            return;
        }
    }
    greet(state, form, call, doc).await;
}

fn verified_for(call: &CallState, account: &Account) -> bool {
    call.verified && call.verify_owner.as_deref() == Some(account.phone.as_str())
}

/// Opening prompt, once per call. Later silent turns go to the watchdog.
async fn greet(state: &AppState, form: &TwilioForm, call: &CallState, doc: &mut Twiml) {
    let config = &state.config;
    if call.greeted {
        doc.redirect(IDLE_PATH);
        return;
    }

    let name = &config.voice.assistant_name;
    let greeting = if config.is_onboarding_line(&form.to) {
        match state
            .onboarding
            .resume_or_start(&form.from, Line::Onboarding)
            .await
        {
            Ok(Opening::Resumed(step)) => format!(
                "Welcome back. Let's pick up where we left off. {}",
                onboarding::prompt_text(&Reply::Ask(step), Channel::Voice)
            ),
            Ok(Opening::Started) => greeting::onboarding_greeting(name),
            Err(e) => {
                tracing::warn!(caller = %form.from, "Onboarding not started: {e}");
                greeting::onboarding_greeting(name)
            }
        }
    } else {
        greeting::select_greeting(&form.from, name, &config.voice.greetings, Utc::now())
    };

    tracing::info!(call_sid = %form.call_sid, caller = %form.from, "Greeting caller");
    listen(config, doc, Some(&greeting));
    state.calls.mark_greeted(&form.call_sid).await;
}

async fn paused_notice(
    state: &AppState,
    form: &TwilioForm,
    owner: &Account,
    call: &CallState,
    doc: &mut Twiml,
) {
    if !call.owner_notified && owner.phone != form.from {
        send_in_background(
            state.sms.clone(),
            owner.phone.clone(),
            format!(
                "{} just called your line while it is paused. Text us to resume service.",
                form.from
            ),
        );
        state.calls.mark_owner_notified(&form.call_sid).await;
    }
    listen(
        &state.config,
        doc,
        Some("This line is paused right now. You can stay on the line, or try again later."),
    );
}

/// `Some` when the utterance belongs to the onboarding flow.
async fn onboarding_turn(
    state: &AppState,
    form: &TwilioForm,
    input: &str,
) -> Result<Option<Reply>, TurnError> {
    let caller = form.from.as_str();
    if onboarding::is_trigger(input) {
        let line = if state.config.is_onboarding_line(&form.to) {
            Line::Onboarding
        } else {
            Line::Main
        };
        return Ok(Some(state.onboarding.start(caller, line).await?));
    }
    Ok(state.onboarding.handle(caller, input).await?)
}

fn speak_onboarding(state: &AppState, form: &TwilioForm, reply: &Reply, doc: &mut Twiml) {
    if let Reply::AssignedNumber(Some(_)) = reply {
        send_in_background(
            state.sms.clone(),
            form.from.clone(),
            onboarding::prompt_text(reply, Channel::Sms),
        );
    }
    let text = onboarding::prompt_text(reply, Channel::Voice);
    if reply.is_terminal() {
        say(&state.config, doc, &text);
        listen(&state.config, doc, None);
    } else {
        listen(&state.config, doc, Some(&text));
    }
}
