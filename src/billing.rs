use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Config;

pub const DEFAULT_PLAN: &str = "basic";

const CHECKOUT_URL: &str = "https://api.stripe.com/v1/checkout/sessions";

#[async_trait]
pub trait CheckoutLinks: Send + Sync {
    /// Hosted checkout page URL for `phone` subscribing to `plan`.
    async fn create_checkout(
        &self,
        phone: &str,
        plan: &str,
        crypto: bool,
    ) -> Result<String, CheckoutError>;
}

/// Stripe Checkout Sessions in subscription mode.
pub struct StripeCheckout {
    client: reqwest::Client,
    api_key: String,
    prices: std::collections::HashMap<String, String>,
    success_url: String,
    cancel_url: String,
    crypto_coupon: Option<String>,
}

#[derive(Deserialize)]
struct SessionResponse {
    url: Option<String>,
}

impl StripeCheckout {
    pub fn new(config: &Config) -> Self {
        let base = config.server.external_url.trim_end_matches('/');
        let stripe = &config.stripe;
        Self {
            client: reqwest::Client::new(),
            api_key: stripe.api_key.clone(),
            prices: stripe
                .prices
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            success_url: stripe
                .success_url
                .clone()
                .unwrap_or_else(|| format!("{base}/billing/success")),
            cancel_url: stripe
                .cancel_url
                .clone()
                .unwrap_or_else(|| format!("{base}/billing/cancel")),
            crypto_coupon: stripe.crypto_coupon.clone(),
        }
    }

    fn form(&self, phone: &str, price: &str, crypto: bool) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("mode", "subscription".to_string()),
            ("line_items[0][price]", price.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", self.success_url.clone()),
            ("cancel_url", self.cancel_url.clone()),
            ("client_reference_id", phone.to_string()),
            ("metadata[phone]", phone.to_string()),
        ];
        if crypto {
            if let Some(ref coupon) = self.crypto_coupon {
                params.push(("discounts[0][coupon]", coupon.clone()));
            }
        }
        params
    }
}

#[async_trait]
impl CheckoutLinks for StripeCheckout {
    async fn create_checkout(
        &self,
        phone: &str,
        plan: &str,
        crypto: bool,
    ) -> Result<String, CheckoutError> {
        if self.api_key.is_empty() {
            return Err(CheckoutError::NotConfigured);
        }
        let plan = plan.trim().to_lowercase();
        let price = self
            .prices
            .get(&plan)
            .ok_or_else(|| CheckoutError::UnknownPlan(plan.clone()))?;

        let resp = self
            .client
            .post(CHECKOUT_URL)
            .basic_auth(&self.api_key, None::<&str>)
            .form(&self.form(phone, price, crypto))
            .send()
            .await
            .map_err(|e| CheckoutError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CheckoutError::Api(format!("{status}: {body}")));
        }

        let session: SessionResponse = resp
            .json()
            .await
            .map_err(|e| CheckoutError::Request(e.to_string()))?;
        let url = session
            .url
            .ok_or_else(|| CheckoutError::Api("Checkout session has no url".into()))?;

        tracing::info!(phone, plan = %plan, crypto, "Checkout session created");
        Ok(url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("payments are not configured")]
    NotConfigured,
    #[error("unknown plan '{0}'")]
    UnknownPlan(String),
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Stripe API error: {0}")]
    Api(String),
}
