//! Stripe payment provider implementation (card-international gateway)
//!
//! Uses PaymentIntents: initiate creates an intent and hands its client secret
//! to the browser; confirmation retrieves the intent and requires `succeeded`.

use anyhow::Context;
use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::Gateway;
use crate::payments::providers::client::{ProviderClient, RequestBody};
use crate::payments::signature;
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{
    from_minor_units, to_minor_units, ConfirmationEvent, PaymentRequest, PaymentSession,
    ProviderConfirmation,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";
const SUCCESS_STATUS: &str = "succeeded";
const INTENT_SUCCEEDED_EVENT: &str = "payment_intent.succeeded";

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// `whsec_...` endpoint secret used to sign webhooks
    pub webhook_secret: String,
    pub base_url: String,
    pub default_currency: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Accepted clock skew for webhook signatures
    pub signature_tolerance_secs: i64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: String::new(),
            base_url: "https://api.stripe.com".to_string(),
            default_currency: "usd".to_string(),
            timeout_secs: 30,
            max_retries: 2,
            signature_tolerance_secs: signature::DEFAULT_TOLERANCE_SECS,
        }
    }
}

impl StripeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .context("STRIPE_SECRET_KEY environment variable is required")?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .context("STRIPE_WEBHOOK_SECRET is required when Stripe is enabled")?;
        if secret_key.trim().is_empty() || webhook_secret.trim().is_empty() {
            anyhow::bail!("STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET cannot be empty");
        }

        let defaults = Self::default();
        Ok(Self {
            secret_key,
            webhook_secret,
            base_url: std::env::var("STRIPE_BASE_URL").unwrap_or(defaults.base_url),
            default_currency: std::env::var("STRIPE_DEFAULT_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.default_currency),
            timeout_secs: std::env::var("STRIPE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("STRIPE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            signature_tolerance_secs: defaults.signature_tolerance_secs,
        })
    }
}

pub struct StripeProvider {
    config: StripeConfig,
    client: ProviderClient,
}

impl StripeProvider {
    pub fn new(config: StripeConfig) -> anyhow::Result<Self> {
        let client = ProviderClient::new(
            "Stripe",
            &config.base_url,
            &config.secret_key,
            config.timeout_secs,
            config.max_retries,
        )
        .context("Failed to create Stripe HTTP client")?;

        Ok(Self { config, client })
    }

    /// Form fields for `POST /v1/payment_intents`
    fn intent_form(&self, request: &PaymentRequest, amount: i64) -> Vec<(String, String)> {
        let currency = request
            .currency
            .as_deref()
            .unwrap_or(&self.config.default_currency)
            .to_lowercase();

        let mut form = vec![
            ("amount".to_string(), amount.to_string()),
            ("currency".to_string(), currency),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        if let Some(email) = request.email.as_ref().filter(|e| e.contains('@')) {
            form.push(("receipt_email".to_string(), email.clone()));
        }
        for (key, value) in &request.metadata {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form.push((format!("metadata[{}]", key), value));
        }
        form
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn gateway(&self) -> Gateway {
        Gateway::CardInternational
    }

    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentSession> {
        let coin = request.validate()?;
        let amount = to_minor_units(request.amount())?;

        let form = serde_urlencoded::to_string(self.intent_form(&request, amount))
            .map_err(|e| PaymentError::InvalidRequest(format!("unencodable request: {}", e)))?;

        // Same caller reference => Stripe returns the same intent instead of a new one
        let idempotency_key = request.reference_or_generate();

        info!(
            user_id = %coin.user_id,
            coins = coin.coins,
            "Creating Stripe payment intent for {} minor units",
            amount
        );

        let intent = self
            .client
            .send(
                Method::POST,
                "/v1/payment_intents",
                RequestBody::Form(&form),
                &[("Idempotency-Key", idempotency_key)],
            )
            .await?;

        let id = intent.get("id").and_then(Value::as_str).map(str::to_string);
        let client_secret = intent
            .get("client_secret")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (Some(id), Some(client_secret)) = (id, client_secret) else {
            return Err(PaymentError::UpstreamUnavailable {
                provider: "Stripe".to_string(),
                message: "payment intent response is missing id or client_secret".to_string(),
                details: Some(intent),
            });
        };

        info!("Stripe payment intent created: {}", id);

        Ok(PaymentSession {
            gateway: Gateway::CardInternational,
            reference: id,
            authorization_url: None,
            access_code: None,
            client_secret: Some(client_secret),
            provider_data: Some(json!({
                "status": intent.get("status").cloned().unwrap_or(Value::Null),
            })),
        })
    }

    async fn fetch_confirmation(&self, reference: &str) -> PaymentResult<Value> {
        if !reference.starts_with("pi_") {
            return Err(PaymentError::InvalidRequest(format!(
                "'{}' is not a Stripe payment intent id",
                reference
            )));
        }
        info!("Retrieving Stripe payment intent {}", reference);

        self.client
            .send(
                Method::GET,
                &format!("/v1/payment_intents/{}", reference),
                RequestBody::Empty,
                &[],
            )
            .await
    }

    fn parse_confirmation(&self, payload: &Value) -> PaymentResult<ConfirmationEvent> {
        let amount = payload
            .get("amount_received")
            .and_then(Value::as_i64)
            .filter(|a| *a > 0)
            .or_else(|| payload.get("amount").and_then(Value::as_i64))
            .unwrap_or(0);

        let mut extras = Map::new();
        if let Some(method) = payload
            .pointer("/payment_method_types/0")
            .and_then(Value::as_str)
        {
            extras.insert("paymentMethod".to_string(), json!(method));
        }

        ProviderConfirmation {
            gateway: Gateway::CardInternational,
            success_status: SUCCESS_STATUS,
            status: payload.get("status").and_then(Value::as_str),
            reference: payload.get("id").and_then(Value::as_str),
            metadata: payload.get("metadata"),
            gross_amount: from_minor_units(amount),
            currency: payload.get("currency").and_then(Value::as_str),
            extras,
        }
        .into_event()
    }

    fn validate_webhook_signature(&self, headers: &HeaderMap, payload: &[u8]) -> PaymentResult<()> {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::InvalidSignature)?;

        signature::verify_timestamped_sha256(
            self.config.webhook_secret.as_bytes(),
            payload,
            header,
            self.config.signature_tolerance_secs,
        )
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<Option<ConfirmationEvent>> {
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed webhook body: {}", e)))?;

        let event_type = body.get("type").and_then(Value::as_str).unwrap_or_default();
        if event_type != INTENT_SUCCEEDED_EVENT {
            info!("Ignoring Stripe webhook event: {}", event_type);
            return Ok(None);
        }

        let intent = body.pointer("/data/object").ok_or_else(|| {
            PaymentError::MissingMetadata("webhook has no data.object".to_string())
        })?;
        self.parse_confirmation(intent).map(Some)
    }
}
