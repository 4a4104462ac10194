use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TwilioConfig;

/// Twilio caps a single message well above this, but long bodies arrive
/// out of order on some carriers; 400 keeps parts readable.
pub const SMS_CHUNK_CHARS: usize = 400;

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError>;
}

/// Twilio REST API client for outbound text messages.
pub struct TwilioSms {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSms {
    pub fn new(twilio_config: &TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            from_number: twilio_config.phone_number.clone(),
        }
    }

    async fn send_part(&self, to: &str, part: &str) -> Result<String, SmsError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );

        let params = [("To", to), ("From", &self.from_number), ("Body", part)];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| SmsError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SmsError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SmsError::Request(e.to_string()))?;

        Ok(body["sid"].as_str().unwrap_or("unknown").to_string())
    }
}

#[async_trait]
impl SmsSender for TwilioSms {
    /// Sends `body` in order as one or more parts.
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError> {
        if self.account_sid.is_empty() || self.auth_token.is_empty() {
            return Err(SmsError::NotConfigured);
        }
        for part in chunk_message(body, SMS_CHUNK_CHARS) {
            let sid = self.send_part(to, part).await?;
            tracing::info!(to, len = part.len(), message_sid = %sid, "SMS part sent");
        }
        Ok(())
    }
}

/// Send without waiting. Failures are logged and otherwise ignored.
pub fn send_in_background(sms: Arc<dyn SmsSender>, to: String, body: String) {
    tokio::spawn(async move {
        if let Err(e) = sms.send(&to, &body).await {
            tracing::warn!(to = %to, "SMS not sent: {e}");
        }
    });
}

/// Split into parts of at most `limit` characters, preferring to break
/// after whitespace.
pub fn chunk_message(message: &str, limit: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = message.trim();

    while !rest.is_empty() {
        let Some((cut, _)) = rest.char_indices().nth(limit) else {
            parts.push(rest);
            break;
        };
        let head = &rest[..cut];
        let split = match head.rfind(char::is_whitespace) {
            Some(i) if i > 0 => i,
            _ => cut,
        };
        parts.push(rest[..split].trim_end());
        rest = rest[split..].trim_start();
    }

    parts
}

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("Twilio credentials are not configured")]
    NotConfigured,
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Twilio API error: {0}")]
    Api(String),
}
