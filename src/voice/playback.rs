//! GET/POST /play: poll a reply job until its result can be played.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use super::{listen, listen_after_reply, respond, say, TurnError};
use crate::session::JobResult;
use crate::twilio::{TwilioForm, Webhook};
use crate::twiml::{Twiml, VerbSink};
use crate::AppState;

const HOLD_TEXT: &str = "One moment while I prepare your answer.";
const LOST_TEXT: &str = "Sorry, I lost track of that request.";
const SNAG_TEXT: &str = "Sorry, I hit a snag. Please try again.";
const TOO_SLOW_TEXT: &str = "Sorry, that's taking longer than it should. Let's try again.";

/// Query parameters are kept as strings so a mangled value degrades to a
/// default instead of a rejected request.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlayParams {
    pub job: String,
    pub n: String,
    pub hold: String,
}

pub fn play_url(job_id: &str, n: u32, held: bool) -> String {
    format!(
        "/play?job={}&n={n}&hold={}",
        urlencoding::encode(job_id),
        u8::from(held)
    )
}

pub async fn handle_play(
    State(state): State<AppState>,
    params: Result<Query<PlayParams>, QueryRejection>,
    Webhook(form): Webhook,
) -> Response {
    let params = params.map(|Query(p)| p).unwrap_or_default();
    respond(&state.config, poll(&state, &params, &form)).await
}

async fn poll(state: &AppState, params: &PlayParams, form: &TwilioForm) -> Result<Twiml, TurnError> {
    let config = &state.config;
    let mut doc = Twiml::new();

    let job_id = params.job.trim();
    if job_id.is_empty() {
        listen(config, &mut doc, Some(LOST_TEXT));
        return Ok(doc);
    }
    let n: u32 = params.n.trim().parse().unwrap_or(0);
    let held = params.hold.trim() == "1";

    let Some(result) = state.jobs.get(job_id).await else {
        let pause = config.voice.poll_pause_secs.max(1);
        if n.saturating_mul(pause) >= config.voice.max_reply_wait_secs {
            tracing::warn!(job_id, polls = n, "Reply job timed out");
            state.calls.touch_activity(&form.call_sid).await;
            listen(config, &mut doc, Some(TOO_SLOW_TEXT));
            return Ok(doc);
        }

        doc.pause(pause);
        let next = n + 1;
        if !held && next.saturating_mul(pause) >= config.voice.hold_message_after_secs {
            tracing::debug!(job_id, polls = next, "Playing hold message");
            say(config, &mut doc, HOLD_TEXT);
            doc.redirect(play_url(job_id, next, true));
        } else {
            doc.redirect(play_url(job_id, next, held));
        }
        return Ok(doc);
    };

    match result {
        JobResult::Ready { audio_ref } => {
            doc.play(config.audio_url(&audio_ref));
            listen_after_reply(config, &mut doc, None);
        }
        JobResult::ReadyText { text } => {
            say(config, &mut doc, &text);
            listen_after_reply(config, &mut doc, None);
        }
        JobResult::Error { message } => {
            tracing::warn!(job_id, %message, "Reply job failed, apologising");
            listen_after_reply(config, &mut doc, Some(SNAG_TEXT));
        }
    }
    // The idle tick after the reply restarts the clock again once playback is over.
    state.calls.touch_activity(&form.call_sid).await;
    Ok(doc)
}
