//! Prometheus counters, served as text on GET /metrics.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics text is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Process-wide counters. Clones share the same underlying values.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub sms_requests: IntCounter,
    pub voice_requests: IntCounter,
    pub sms_replies: IntCounter,
    pub onboarding_starts: IntCounter,
    pub payments_started: IntCounter,
    pub tts_failures: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let sms_requests = counter(&registry, "aicon_sms_requests_total", "Incoming SMS requests")?;
        let voice_requests =
            counter(&registry, "aicon_voice_requests_total", "Incoming voice requests")?;
        let sms_replies = counter(&registry, "aicon_sms_replies_total", "SMS replies sent")?;
        let onboarding_starts =
            counter(&registry, "aicon_onboarding_starts_total", "Onboarding starts")?;
        let payments_started =
            counter(&registry, "aicon_payments_started_total", "Payments started")?;
        let tts_failures = counter(&registry, "aicon_tts_failures_total", "TTS failures")?;

        Ok(Self {
            registry,
            sms_requests,
            voice_requests,
            sms_replies,
            onboarding_starts,
            payments_started,
            tts_failures,
        })
    }

    /// All counters in the Prometheus text exposition format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export() {
        Ok(text) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Failed to export metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to export metrics: {e}"),
            )
                .into_response()
        }
    }
}
