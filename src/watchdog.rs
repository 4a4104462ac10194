//! Silence timeout policy for a call waiting on caller speech.

use std::time::Duration;

use crate::session::WarningStage;

pub const DISCONNECT_AFTER: Duration = Duration::from_secs(90);
const FIVE_LEFT_AFTER: Duration = Duration::from_secs(85);
const TEN_LEFT_AFTER: Duration = Duration::from_secs(80);
const FIFTEEN_LEFT_AFTER: Duration = Duration::from_secs(75);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Keep listening, say nothing.
    Listen,
    /// Announce the remaining time, then keep listening.
    Warn(WarningStage),
    Disconnect,
}

/// Decide what to do after `elapsed` seconds of silence, given the last
/// warning already issued. Each stage fires at most once per silence period.
pub fn evaluate(elapsed: Duration, issued: WarningStage) -> WatchdogAction {
    if elapsed >= DISCONNECT_AFTER {
        return WatchdogAction::Disconnect;
    }
    let due = [
        (FIVE_LEFT_AFTER, WarningStage::Five),
        (TEN_LEFT_AFTER, WarningStage::Ten),
        (FIFTEEN_LEFT_AFTER, WarningStage::Fifteen),
    ];
    for (threshold, stage) in due {
        if elapsed >= threshold {
            return if issued < stage {
                WatchdogAction::Warn(stage)
            } else {
                WatchdogAction::Listen
            };
        }
    }
    WatchdogAction::Listen
}

/// Time until the next threshold, so the idle gather can wake up for it.
pub fn until_next_check(elapsed: Duration) -> Duration {
    [FIFTEEN_LEFT_AFTER, TEN_LEFT_AFTER, FIVE_LEFT_AFTER, DISCONNECT_AFTER]
        .into_iter()
        .find(|t| *t > elapsed)
        .map(|t| t - elapsed)
        .unwrap_or(Duration::ZERO)
}

pub fn warning_text(stage: WarningStage) -> String {
    match stage.seconds_left() {
        Some(secs) => format!(
            "Are you still there? I'll hang up in about {secs} seconds unless you say something."
        ),
        None => String::new(),
    }
}

pub const DISCONNECT_TEXT: &str =
    "I haven't heard anything for a while, so I'm going to hang up now. Call back any time. Goodbye!";
