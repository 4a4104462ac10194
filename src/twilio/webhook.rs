use std::convert::Infallible;

use axum::extract::{FromRequest, Request, State};
use axum::response::Response;
use axum::Form;
use serde::Deserialize;

use crate::{twilio, voice, AppState};

/// Fields Twilio posts to voice and messaging webhooks. Absent fields are empty.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TwilioForm {
    pub speech_result: String,
    pub digits: String,
    pub from: String,
    pub to: String,
    pub call_sid: String,
    pub body: String,
    pub message_sid: String,
    pub sms_sid: String,
    /// `<Pay>` outcome.
    pub result: String,
    pub payment_status: String,
}

impl TwilioForm {
    /// Captured speech, else keypad digits. `None` when the caller said nothing.
    pub fn input(&self) -> Option<&str> {
        [self.speech_result.trim(), self.digits.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
    }

    pub fn keypad_only(&self) -> bool {
        self.speech_result.trim().is_empty() && !self.digits.trim().is_empty()
    }

    pub fn is_sms(&self) -> bool {
        !self.message_sid.is_empty() || !self.sms_sid.is_empty()
    }
}

/// Form extractor that never rejects: an unreadable body is an empty form,
/// so the handler still answers with valid TwiML.
pub struct Webhook(pub TwilioForm);

impl<S> FromRequest<S> for Webhook
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Form::<TwilioForm>::from_request(req, state).await {
            Ok(Form(form)) => Ok(Webhook(form)),
            Err(e) => {
                tracing::warn!("Unreadable webhook form, treating as empty: {e}");
                Ok(Webhook(TwilioForm::default()))
            }
        }
    }
}

/// Handle POST /twilio and /onboard, where one number takes both calls and texts.
///
/// Messaging webhooks carry `MessageSid`/`SmsSid`; everything else is a call.
pub async fn handle_unified(State(state): State<AppState>, Webhook(form): Webhook) -> Response {
    if form.is_sms() {
        twilio::sms::reply(&state, &form).await
    } else {
        voice::turn::respond_to_turn(&state, &form).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(speech: &str, digits: &str) -> TwilioForm {
        TwilioForm {
            speech_result: speech.into(),
            digits: digits.into(),
            ..TwilioForm::default()
        }
    }

    #[test]
    fn speech_wins_over_digits() {
        let f = form(" hello there ", "1");
        assert_eq!(f.input(), Some("hello there"));
        assert!(!f.keypad_only());
    }

    #[test]
    fn digits_alone_count_as_input() {
        let f = form("", "2");
        assert_eq!(f.input(), Some("2"));
        assert!(f.keypad_only());
    }

    #[test]
    fn blank_speech_is_no_input() {
        assert_eq!(form("   ", "").input(), None);
    }

    #[test]
    fn message_sid_marks_sms() {
        let sms = TwilioForm {
            message_sid: "SM1".into(),
            ..TwilioForm::default()
        };
        let legacy = TwilioForm {
            sms_sid: "SM1".into(),
            ..TwilioForm::default()
        };
        let call = TwilioForm {
            call_sid: "CA1".into(),
            ..TwilioForm::default()
        };
        assert!(sms.is_sms());
        assert!(legacy.is_sms());
        assert!(!call.is_sms());
    }

    #[test]
    fn pascal_case_field_names() {
        let f: TwilioForm = serde_json::from_value(serde_json::json!({
            "SpeechResult": "hi",
            "CallSid": "CA9",
            "PaymentStatus": "success",
            "AccountSid": "ignored",
        }))
        .unwrap();
        assert_eq!(f.speech_result, "hi");
        assert_eq!(f.call_sid, "CA9");
        assert_eq!(f.payment_status, "success");
    }
}
