//! Paystack payment provider implementation (card-regional gateway)
//!
//! Card and mobile-money payments in Nigeria, Ghana, Kenya and South Africa.
//! Amounts travel in the smallest currency unit (kobo, pesewas, cents).

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
    from_minor_units, to_minor_units, ConfirmationEvent, PaymentRequest, PaymentSession,
    ProviderConfirmation,
};

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";
const SUCCESS_STATUS: &str = "success";
const CHARGE_SUCCESS_EVENT: &str = "charge.success";

/// Paystack payment provider configuration
#[derive(Debug, Clone)]
pub struct PaystackConfig {
    /// Paystack API secret key; also the webhook signing key
    pub secret_key: String,
    /// Paystack API base URL (defaults to https://api.paystack.co)
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of retries for failed requests
    pub max_retries: u32,
}

impl Default for PaystackConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            base_url: "https://api.paystack.co".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl PaystackConfig {
    /// Create config from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let secret_key = std::env::var("PAYSTACK_SECRET_KEY")
            .context("PAYSTACK_SECRET_KEY environment variable is required")?;
        if secret_key.trim().is_empty() {
            anyhow::bail!("PAYSTACK_SECRET_KEY cannot be empty");
        }

        let defaults = Self::default();
        Ok(Self {
            secret_key,
            base_url: std::env::var("PAYSTACK_BASE_URL").unwrap_or(defaults.base_url),
            timeout_secs: std::env::var("PAYSTACK_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("PAYSTACK_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
        })
    }
}

/// Paystack payment provider
pub struct PaystackProvider {
    config: PaystackConfig,
    client: ProviderClient,
}

impl PaystackProvider {
    /// Create a new Paystack provider instance
    pub fn new(config: PaystackConfig) -> anyhow::Result<Self> {
        let client = ProviderClient::new(
            "Paystack",
            &config.base_url,
            &config.secret_key,
            config.timeout_secs,
            config.max_retries,
        )
        .context("Failed to create Paystack HTTP client")?;

        Ok(Self { config, client })
    }

    /// Unwrap Paystack's `{status, message, data}` envelope
    fn unwrap_envelope(&self, body: Value) -> PaymentResult<Value> {
        if body.get("status").and_then(Value::as_bool) == Some(true) {
            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request was not successful")
            .to_string();
        warn!("Paystack API error: {}", message);
        Err(PaymentError::UpstreamUnavailable {
            provider: self.client.provider().to_string(),
            message,
            details: Some(body),
        })
    }
}

#[async_trait]
impl PaymentProvider for PaystackProvider {
    fn gateway(&self) -> Gateway {
        Gateway::CardRegional
    }

    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentSession> {
        request.validate()?;
        let email = request
            .email
            .clone()
            .filter(|e| e.contains('@'))
            .ok_or_else(|| {
                PaymentError::InvalidRequest("Paystack requires a payer email".to_string())
            })?;
        let amount = to_minor_units(request.amount())?;
        let reference = request.reference_or_generate();

        info!(
            "Initiating Paystack payment: {} {} {}",
            amount,
            request.currency.as_deref().unwrap_or("default currency"),
            reference
        );

        let mut payload = json!({
            "email": email,
            "amount": amount,
            "reference": reference,
            "metadata": Value::Object(request.metadata.clone()),
        });
        if let Some(currency) = &request.currency {
            payload["currency"] = Value::String(currency.to_uppercase());
        }
        if let Some(callback_url) = &request.callback_url {
            payload["callback_url"] = Value::String(callback_url.clone());
        }

        let body = self
            .client
            .send(
                Method::POST,
                "/transaction/initialize",
                RequestBody::Json(&payload),
                &[],
            )
            .await?;
        let data = self.unwrap_envelope(body)?;

        let authorization_url = data
            .get("authorization_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        let access_code = data
            .get("access_code")
            .and_then(Value::as_str)
            .map(str::to_string);
        let reference = data
            .get("reference")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(reference);

        if authorization_url.is_none() {
            return Err(PaymentError::UpstreamUnavailable {
                provider: "Paystack".to_string(),
                message: "response is missing authorization_url".to_string(),
                details: Some(data),
            });
        }

        info!(
            "Paystack payment initiated successfully: reference={}",
            reference
        );

        Ok(PaymentSession {
            gateway: Gateway::CardRegional,
            reference,
            authorization_url,
            access_code,
            client_secret: None,
            provider_data: Some(data),
        })
    }

    async fn fetch_confirmation(&self, reference: &str) -> PaymentResult<Value> {
        info!("Verifying Paystack payment: reference={}", reference);

        let body = self
            .client
            .send(
                Method::GET,
                &format!("/transaction/verify/{}", reference),
                RequestBody::Empty,
                &[],
            )
            .await?;
        self.unwrap_envelope(body)
    }

    fn parse_confirmation(&self, payload: &Value) -> PaymentResult<ConfirmationEvent> {
        let mut extras = Map::new();
        if let Some(channel) = payload.get("channel").and_then(Value::as_str) {
            extras.insert("channel".to_string(), json!(channel));
        }
        if let Some(brand) = payload.pointer("/authorization/brand").and_then(Value::as_str) {
            extras.insert("cardBrand".to_string(), json!(brand));
        }

        ProviderConfirmation {
            gateway: Gateway::CardRegional,
            success_status: SUCCESS_STATUS,
            status: payload.get("status").and_then(Value::as_str),
            reference: payload.get("reference").and_then(Value::as_str),
            metadata: payload.get("metadata"),
            gross_amount: from_minor_units(
                payload.get("amount").and_then(Value::as_i64).unwrap_or(0),
            ),
            currency: payload.get("currency").and_then(Value::as_str),
            extras,
        }
        .into_event()
    }

    fn validate_webhook_signature(&self, headers: &HeaderMap, payload: &[u8]) -> PaymentResult<()> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::InvalidSignature)?;

        signature::verify_hmac_sha512_hex(self.config.secret_key.as_bytes(), payload, signature)
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<Option<ConfirmationEvent>> {
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidRequest(format!("malformed webhook body: {}", e)))?;

        let event = body.get("event").and_then(Value::as_str).unwrap_or_default();
        if event != CHARGE_SUCCESS_EVENT {
            info!("Ignoring Paystack webhook event: {}", event);
            return Ok(None);
        }

        let data = body.get("data").ok_or_else(|| {
            PaymentError::MissingMetadata("webhook has no data object".to_string())
        })?;
        self.parse_confirmation(data).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serial_test::serial;

    fn create_test_provider() -> PaystackProvider {
        let config = PaystackConfig {
            secret_key: "sk_test_test_key".to_string(),
            base_url: "https://api.paystack.co".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        };
        PaystackProvider::new(config).unwrap()
    }

    fn verify_data(status: &str) -> Value {
        json!({
            "status": status,
            "reference": "coin_abc",
            "amount": 250000,
            "currency": "NGN",
            "channel": "card",
            "authorization": {"brand": "visa"},
            "metadata": {"userId": "U1", "coins": 50, "packageName": "gold"}
        })
    }

    #[test]
    fn test_webhook_signature_validation_invalid() {
        let provider = create_test_provider();
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("invalid_signature"));
        let result = provider.validate_webhook_signature(&headers, b"test payload");
        assert!(matches!(result, Err(PaymentError::InvalidSignature)));
    }

    #[test]
    fn test_webhook_signature_validation_valid() {
        let provider = create_test_provider();
        let payload = br#"{"event":"charge.success"}"#;
        let sig = signature::sign_hmac_sha512_hex(b"sk_test_test_key", payload);
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        assert!(provider.validate_webhook_signature(&headers, payload).is_ok());
    }

    #[test]
    fn test_webhook_signature_missing_header() {
        let provider = create_test_provider();
        let result = provider.validate_webhook_signature(&HeaderMap::new(), b"{}");
        assert!(matches!(result, Err(PaymentError::InvalidSignature)));
    }

    #[test]
    fn test_parse_successful_verification() {
        let provider = create_test_provider();
        let event = provider.parse_confirmation(&verify_data("success")).unwrap();
        assert_eq!(event.gateway, Gateway::CardRegional);
        assert_eq!(event.reference, "coin_abc");
        assert_eq!(event.user_id, "U1");
        assert_eq!(event.coins, 50);
        assert_eq!(event.gross_amount.to_string(), "2500.00");
        assert_eq!(event.metadata["cardBrand"], "visa");
        assert_eq!(event.metadata["packageName"], "gold");
    }

    #[test]
    fn test_parse_rejects_non_success_status() {
        let provider = create_test_provider();
        for status in ["failed", "abandoned", "pending", "Success"] {
            let err = provider.parse_confirmation(&verify_data(status)).unwrap_err();
            assert!(matches!(err, PaymentError::NotApproved { .. }));
        }
    }

    #[test]
    fn test_parse_webhook_ignores_other_events() {
        let provider = create_test_provider();
        let body = json!({"event": "transfer.success", "data": {}}).to_string();
        assert!(provider.parse_webhook(body.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_parse_webhook_charge_success() {
        let provider = create_test_provider();
        let body = json!({"event": "charge.success", "data": verify_data("success")}).to_string();
        let event = provider.parse_webhook(body.as_bytes()).unwrap().unwrap();
        assert_eq!(event.coins, 50);
    }

    #[test]
    fn test_paystack_config_default() {
        let config = PaystackConfig::default();
        assert_eq!(config.base_url, "https://api.paystack.co");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    #[serial]
    fn test_paystack_config_from_env_missing_key() {
        std::env::remove_var("PAYSTACK_SECRET_KEY");

        let config = PaystackConfig::from_env();
        assert!(config.is_err(), "Config should fail without secret key");
    }
}
