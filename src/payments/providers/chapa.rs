//! Chapa payment provider implementation (mobile-money gateway)
//!
//! Telebirr, CBE Birr, M-Pesa and card payments in Ethiopia. The merchant
//! chooses the `tx_ref`, which is also the idempotency reference. Webhooks are
//! signed with a dedicated secret that must be configured at startup.

use anyhow::Context;
use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::Gateway;
use crate::payments::providers::client::{ProviderClient, RequestBody};
use crate::payments::signature;
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{
    decimal_from_value, ConfirmationEvent, PaymentRequest, PaymentSession, ProviderConfirmation,
};

/// Chapa sends the payload signature under either name
pub const SIGNATURE_HEADERS: [&str; 2] = ["x-chapa-signature", "chapa-signature"];
const SUCCESS_STATUS: &str = "success";
const CHARGE_SUCCESS_EVENT: &str = "charge.success";

#[derive(Debug, Clone)]
pub struct ChapaConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub base_url: String,
    pub default_currency: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ChapaConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: String::new(),
            base_url: "https://api.chapa.co".to_string(),
            default_currency: "ETB".to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl ChapaConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let secret_key = std::env::var("CHAPA_SECRET_KEY")
            .context("CHAPA_SECRET_KEY environment variable is required")?;
        let webhook_secret = std::env::var("CHAPA_WEBHOOK_SECRET")
            .context("CHAPA_WEBHOOK_SECRET is required when Chapa is enabled")?;
        if secret_key.trim().is_empty() || webhook_secret.trim().is_empty() {
            anyhow::bail!("CHAPA_SECRET_KEY and CHAPA_WEBHOOK_SECRET cannot be empty");
        }

        let defaults = Self::default();
        Ok(Self {
            secret_key,
            webhook_secret,
            base_url: std::env::var("CHAPA_BASE_URL").unwrap_or(defaults.base_url),
            default_currency: std::env::var("CHAPA_DEFAULT_CURRENCY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.default_currency),
            timeout_secs: std::env::var("CHAPA_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("CHAPA_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
        })
    }
}

pub struct ChapaProvider {
    config: ChapaConfig,
    client: ProviderClient,
}

impl ChapaProvider {
    pub fn new(config: ChapaConfig) -> anyhow::Result<Self> {
        let client = ProviderClient::new(
            "Chapa",
            &config.base_url,
            &config.secret_key,
            config.timeout_secs,
            config.max_retries,
        )
        .context("Failed to create Chapa HTTP client")?;

        Ok(Self { config, client })
    }

    /// Chapa wraps results in `{status: "success"|"failed", message, data}`
    fn unwrap_envelope(&self, body: Value) -> PaymentResult<Value> {
        if body.get("status").and_then(Value::as_str) == Some("success") {
            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }

        let message = match body.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "request was not successful".to_string(),
        };
        warn!("Chapa API error: {}", message);
        Err(PaymentError::UpstreamUnavailable {
            provider: "Chapa".to_string(),
            message,
            details: Some(body),
        })
    }
}

#[async_trait]
impl PaymentProvider for ChapaProvider {
    fn gateway(&self) -> Gateway {
        Gateway::MobileMoney
    }

    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentSession> {
        request.validate()?;
        let tx_ref = request.reference_or_generate();
        let currency = request
            .currency
            .as_deref()
            .unwrap_or(&self.config.default_currency)
            .to_uppercase();

        let mut payload = json!({
            "amount": request.amount().normalize().to_string(),
            "currency": currency,
            "tx_ref": tx_ref,
            "meta": Value::Object(request.metadata.clone()),
        });
        if let Some(email) = request.email.as_ref().filter(|e| e.contains('@')) {
            payload["email"] = json!(email);
        }
        if let Some(phone) = &request.phone {
            payload["phone_number"] = json!(phone.trim());
        }
        if let Some(callback_url) = &request.callback_url {
            payload["callback_url"] = json!(callback_url);
        }

        info!("Initiating Chapa payment: {} {} {}", request.amount(), currency, tx_ref);

        let body = self
            .client
            .send(
                Method::POST,
                "/v1/transaction/initialize",
                RequestBody::Json(&payload),
                &[],
            )
            .await?;
        let data = self.unwrap_envelope(body)?;

        let checkout_url = data
            .get("checkout_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PaymentError::UpstreamUnavailable {
                provider: "Chapa".to_string(),
                message: "response is missing checkout_url".to_string(),
                details: Some(data.clone()),
            })?;

        Ok(PaymentSession {
            gateway: Gateway::MobileMoney,
            reference: tx_ref,
            authorization_url: Some(checkout_url),
            access_code: None,
            client_secret: None,
            provider_data: None,
        })
    }

    async fn fetch_confirmation(&self, reference: &str) -> PaymentResult<Value> {
        info!("Verifying Chapa payment: tx_ref={}", reference);

        let body = self
            .client
            .send(
                Method::GET,
                &format!("/v1/transaction/verify/{}", reference),
                RequestBody::Empty,
                &[],
            )
            .await?;
        self.unwrap_envelope(body)
    }

    fn parse_confirmation(&self, payload: &Value) -> PaymentResult<ConfirmationEvent> {
        let mut extras = Map::new();
        let extra_fields = [
            ("method", "paymentMethod"),
            ("payment_method", "paymentMethod"),
            ("reference", "providerReference"),
        ];
        for (field, key) in extra_fields {
            if let Some(v) = payload.get(field).and_then(Value::as_str) {
                extras.insert(key.to_string(), json!(v));
            }
        }

        ProviderConfirmation {
            gateway: Gateway::MobileMoney,
            success_status: SUCCESS_STATUS,
            status: payload.get("status").and_then(Value::as_str),
            reference: payload.get("tx_ref").and_then(Value::as_str),
            metadata: payload.get("meta"),
            gross_amount: decimal_from_value(payload.get("amount")),
            currency: payload.get("currency").and_then(Value::as_str),
            extras,
        }
        .into_event()
    }

    fn validate_webhook_signature(&self, headers: &HeaderMap, payload: &[u8]) -> PaymentResult<()> {
        let signature = SIGNATURE_HEADERS
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::InvalidSignature)?;

        signature::verify_hmac_sha256_hex(self.config.webhook_secret.as_bytes(), payload, signature)
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<Option<ConfirmationEvent>> {
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed webhook body: {}", e)))?;

        // Payment webhooks are flat; older deliveries omit `event`
        match body.get("event").and_then(Value::as_str) {
            Some(CHARGE_SUCCESS_EVENT) | None => self.parse_confirmation(&body).map(Some),
            Some(other) => {
                info!("Ignoring Chapa webhook event: {}", other);
                Ok(None)
            }
        }
    }
}
