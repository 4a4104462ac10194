pub mod outbound;
pub mod sms;
pub mod webhook;

pub use outbound::{SmsError, SmsSender, TwilioSms};
pub use webhook::{TwilioForm, Webhook};
