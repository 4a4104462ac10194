//! POST /voice/idle: silence watchdog tick.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use serde::Deserialize;

use super::{listen_for, respond, say, TurnError};
use crate::twilio::{TwilioForm, Webhook};
use crate::twiml::Twiml;
use crate::watchdog::{self, WatchdogAction};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IdleParams {
    /// `1` right after a reply finished playing.
    pub reset: String,
}

pub async fn handle_idle(
    State(state): State<AppState>,
    params: Result<Query<IdleParams>, QueryRejection>,
    Webhook(form): Webhook,
) -> Response {
    let reset = params.is_ok_and(|Query(p)| p.reset.trim() == "1");
    respond(&state.config, tick(&state, &form, reset)).await
}

async fn tick(state: &AppState, form: &TwilioForm, reset: bool) -> Result<Twiml, TurnError> {
    let config = &state.config;
    let call_sid = form.call_sid.as_str();
    if reset {
        state.calls.touch_activity(call_sid).await;
    }
    let call = state.calls.ensure_started(call_sid).await;
    let elapsed = (Utc::now() - call.last_activity)
        .to_std()
        .unwrap_or_default();

    let mut doc = Twiml::new();
    let action = watchdog::evaluate(elapsed, call.warning_stage);
    let prompt = match action {
        WatchdogAction::Disconnect => {
            tracing::info!(call_sid, elapsed_secs = elapsed.as_secs(), "Watchdog: disconnecting");
            say(config, &mut doc, watchdog::DISCONNECT_TEXT);
            doc.hangup();
            return Ok(doc);
        }
        WatchdogAction::Warn(stage) => {
            tracing::info!(call_sid, ?stage, elapsed_secs = elapsed.as_secs(), "Watchdog: warning");
            state.calls.set_warning(call_sid, stage).await;
            Some(watchdog::warning_text(stage))
        }
        WatchdogAction::Listen => None,
    };

    // Wake up in time for the next threshold instead of a full gather timeout.
    let until_next = watchdog::until_next_check(elapsed).as_secs_f64().ceil() as u32;
    let timeout = until_next.clamp(1, config.voice.gather_timeout_secs.max(1));
    listen_for(config, &mut doc, prompt.as_deref(), timeout);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CallState, WarningStage};
    use crate::test_support::{Harness, MAIN_LINE};
    use chrono::Duration;

    fn form(sid: &str) -> Vec<(&'static str, String)> {
        vec![
            ("CallSid", sid.to_string()),
            ("From", "+15550001111".to_string()),
            ("To", MAIN_LINE.to_string()),
        ]
    }

    async fn silent_for(h: &Harness, sid: &str, secs: i64, stage: WarningStage) {
        let state = CallState {
            last_activity: Utc::now() - Duration::seconds(secs),
            warning_stage: stage,
            greeted: true,
            ..CallState::default()
        };
        h.state.calls.put(sid, &state).await;
    }

    #[tokio::test]
    async fn quiet_call_keeps_listening_without_prompt() {
        let h = Harness::new();
        silent_for(&h, "CA1", 5, WarningStage::None).await;
        let xml = h.post("/voice/idle", &form("CA1")).await;
        assert!(xml.contains(r#"<Gather input="speech dtmf" action="/voice""#));
        assert!(!xml.contains("<Say"));
        assert!(xml.ends_with("<Redirect method=\"POST\">/voice/idle</Redirect></Response>"));
    }

    #[tokio::test]
    async fn fifteen_second_warning_fires_once() {
        let h = Harness::new();
        silent_for(&h, "CA2", 76, WarningStage::None).await;
        let first = h.post("/voice/idle", &form("CA2")).await;
        assert!(first.contains("15 seconds"));
        assert_eq!(
            h.state.calls.get("CA2").await.warning_stage,
            WarningStage::Fifteen
        );

        let second = h.post("/voice/idle", &form("CA2")).await;
        assert!(!second.contains("<Say"));
    }

    #[tokio::test]
    async fn ninety_seconds_hangs_up() {
        let h = Harness::new();
        silent_for(&h, "CA3", 91, WarningStage::Five).await;
        let xml = h.post("/voice/idle", &form("CA3")).await;
        assert!(xml.contains("going to hang up"));
        assert!(xml.contains("<Hangup/>"));
        assert!(!xml.contains("<Gather"));
    }

    #[tokio::test]
    async fn gather_wakes_for_next_threshold() {
        let h = Harness::new();
        silent_for(&h, "CA4", 72, WarningStage::None).await;
        let xml = h.post("/voice/idle", &form("CA4")).await;
        assert!(xml.contains(r#"timeout="3""#) || xml.contains(r#"timeout="4""#));
    }

    #[tokio::test]
    async fn long_reply_playback_is_not_counted_as_silence() {
        let h = Harness::new();
        // A long answer just finished; the last activity is from before it played.
        silent_for(&h, "CA5", 80, WarningStage::None).await;
        h.state
            .jobs
            .publish("long", &crate::session::JobResult::Ready { audio_ref: "audio/long.mp3".into() })
            .await
            .unwrap();
        let played = h.post("/play?job=long&n=3&hold=1", &form("CA5")).await;
        assert!(played.contains("/voice/idle?reset=1"));

        silent_for(&h, "CA5", 80, WarningStage::None).await;
        let xml = h.post("/voice/idle?reset=1", &form("CA5")).await;
        assert!(!xml.contains("<Say"));
        assert!(!xml.contains("<Hangup/>"));
        assert_eq!(h.state.calls.get("CA5").await.warning_stage, WarningStage::None);
        assert!(xml.ends_with("<Redirect method=\"POST\">/voice/idle</Redirect></Response>"));

        // A plain tick keeps the clock running.
        silent_for(&h, "CA6", 80, WarningStage::None).await;
        let plain = h.post("/voice/idle", &form("CA6")).await;
        assert!(plain.contains("Are you still there?"));
    }

    #[tokio::test]
    async fn unknown_call_starts_the_clock() {
        let h = Harness::new();
        let xml = h.post("/voice/idle", &form("CA-new")).await;
        assert!(!xml.contains("<Hangup/>"));
        let stored = h.kv.get(crate::session::call_state::NAMESPACE, "CA-new").await;
        assert!(stored.unwrap().is_some());
    }
}
