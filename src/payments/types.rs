//! Payment provider types and data structures
//!
//! Canonical types shared by all providers: the initiate request, the session
//! handle returned to the client, and the Confirmation Event handed to the
//! credit applier.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{Gateway, IdempotencyKey, PaymentRecord, PaymentRecordStatus};

const USER_ID_KEYS: [&str; 2] = ["userId", "user_id"];
const COIN_KEYS: [&str; 2] = ["coins", "coinAmount"];
/// Metadata keys copied verbatim into the payment record
const DESCRIPTIVE_KEYS: [&str; 3] = ["packageName", "package", "description"];
const MAX_REFERENCE_LEN: usize = 128;

/// Payment request for initiating a transaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Payer email address
    #[serde(default)]
    pub email: Option<String>,
    /// Payer phone number (mobile money)
    #[serde(default)]
    pub phone: Option<String>,
    /// Amount in major currency units (e.g. 12.50)
    #[serde(default)]
    pub amount: Option<Decimal>,
    /// Currency code; providers fall back to their configured default
    #[serde(default)]
    pub currency: Option<String>,
    /// Caller-chosen reference; generated when absent
    #[serde(default)]
    pub reference: Option<String>,
    /// Where the provider should redirect after payment
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Must carry `userId` and `coins`; other keys are passed through
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PaymentRequest {
    /// Check the minimum every provider needs: a payer identifier, a positive
    /// amount and the coin metadata that will come back on confirmation.
    pub fn validate(&self) -> PaymentResult<CoinMetadata> {
        let has_email = self.email.as_deref().is_some_and(|e| e.contains('@'));
        let has_phone = self.phone.as_deref().is_some_and(|p| !p.trim().is_empty());
        if !has_email && !has_phone {
            return Err(PaymentError::InvalidRequest(
                "a payer email or phone number is required".to_string(),
            ));
        }

        match self.amount {
            Some(amount) if amount > Decimal::ZERO => {}
            _ => {
                return Err(PaymentError::InvalidRequest(
                    "amount must be greater than zero".to_string(),
                ))
            }
        }

        if let Some(reference) = self.reference.as_deref().filter(|r| !r.trim().is_empty()) {
            validate_reference(reference)?;
        }

        CoinMetadata::extract(&Value::Object(self.metadata.clone())).map_err(|e| match e {
            PaymentError::MissingMetadata(msg) => PaymentError::InvalidRequest(msg),
            other => other,
        })
    }

    /// Validated amount; only call after [`validate`](Self::validate)
    pub fn amount(&self) -> Decimal {
        self.amount.unwrap_or(Decimal::ZERO)
    }

    pub fn reference_or_generate(&self) -> String {
        self.reference
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_reference)
    }
}

/// Session handle returned by the provider, forwarded to the client unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub gateway: Gateway,
    /// Reference the confirmation will later be looked up by
    pub reference: String,
    /// Redirect URL for hosted checkouts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
    /// Access code for inline payment forms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    /// Client-side secret for card elements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Provider-specific response data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_data: Option<Value>,
}

/// User and coin amount recovered from provider metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinMetadata {
    pub user_id: String,
    pub coins: u64,
}

impl CoinMetadata {
    /// Extract `userId` / `coins` from a metadata bag.
    ///
    /// Accepts an object or a JSON-encoded string holding one. Coins must be a
    /// positive integer, either as a JSON number or a decimal string.
    pub fn extract(metadata: &Value) -> PaymentResult<Self> {
        let object = metadata_object(metadata)
            .ok_or_else(|| PaymentError::MissingMetadata("metadata is absent".to_string()))?;

        let user_id = USER_ID_KEYS
            .iter()
            .find_map(|k| object.get(*k))
            .and_then(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PaymentError::MissingMetadata("userId is missing".to_string()))?;

        let raw_coins = COIN_KEYS
            .iter()
            .find_map(|k| object.get(*k))
            .ok_or_else(|| PaymentError::MissingMetadata("coins is missing".to_string()))?;

        let coins = parse_coins(raw_coins).ok_or_else(|| {
            PaymentError::MissingMetadata(format!(
                "coins must be a positive integer, got {}",
                raw_coins
            ))
        })?;

        Ok(Self { user_id, coins })
    }
}

fn metadata_object(metadata: &Value) -> Option<Map<String, Value>> {
    match metadata {
        Value::Object(map) => Some(map.clone()),
        // Paystack echoes metadata back as a string when it was sent as one
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn parse_coins(value: &Value) -> Option<u64> {
    let coins = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (coins > 0).then_some(coins)
}

/// Normalised, validated payment confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationEvent {
    pub gateway: Gateway,
    pub reference: String,
    pub user_id: String,
    pub coins: u64,
    /// Raw provider status, kept for logging
    pub provider_status: String,
    pub gross_amount: Decimal,
    pub currency: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ConfirmationEvent {
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.gateway, self.reference.clone())
    }

    /// Payment record stamped with the time the credit is applied
    pub fn to_record(&self, timestamp: DateTime<Utc>) -> PaymentRecord {
        PaymentRecord {
            gateway: self.gateway,
            reference: self.reference.clone(),
            coins: self.coins,
            gross_amount: self.gross_amount,
            currency: self.currency.clone(),
            status: PaymentRecordStatus::Success,
            timestamp,
            metadata: self.metadata.clone(),
        }
    }
}

/// Provider payload fields every adapter pulls out before normalisation
#[derive(Debug, Clone)]
pub struct ProviderConfirmation<'a> {
    pub gateway: Gateway,
    /// The provider's own "successful" status value
    pub success_status: &'static str,
    pub status: Option<&'a str>,
    pub reference: Option<&'a str>,
    pub metadata: Option<&'a Value>,
    pub gross_amount: Decimal,
    pub currency: Option<&'a str>,
    /// Provider-side descriptive fields (channel, card brand, ...)
    pub extras: Map<String, Value>,
}

impl ProviderConfirmation<'_> {
    /// Turn the provider fields into a Confirmation Event or reject them.
    ///
    /// Status is compared for exact equality with the provider's sentinel.
    pub fn into_event(self) -> PaymentResult<ConfirmationEvent> {
        let status = self.status.unwrap_or_default();
        if status != self.success_status {
            return Err(PaymentError::NotApproved {
                status: if status.is_empty() {
                    "unknown".to_string()
                } else {
                    status.to_string()
                },
            });
        }

        let reference = self
            .reference
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                PaymentError::MissingMetadata("transaction reference is missing".to_string())
            })?
            .to_string();

        let coin = CoinMetadata::extract(self.metadata.unwrap_or(&Value::Null))?;

        let mut metadata = self.extras;
        if let Some(object) = self.metadata.and_then(metadata_object) {
            for key in DESCRIPTIVE_KEYS {
                if let Some(v) = object.get(key) {
                    metadata.insert(key.to_string(), v.clone());
                }
            }
        }

        Ok(ConfirmationEvent {
            gateway: self.gateway,
            reference,
            user_id: coin.user_id,
            coins: coin.coins,
            provider_status: status.to_string(),
            gross_amount: self.gross_amount,
            currency: self.currency.map(str::to_string),
            metadata,
        })
    }
}

/// Check a caller-supplied reference before it is placed in a provider URL.
///
/// Provider references are short tokens of ASCII letters, digits, `-`, `_`
/// and `.`; anything else is rejected rather than escaped.
pub fn validate_reference(reference: &str) -> PaymentResult<&str> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(PaymentError::InvalidRequest(
            "reference is required".to_string(),
        ));
    }
    if reference.len() > MAX_REFERENCE_LEN
        || !reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(PaymentError::InvalidRequest(format!(
            "reference '{}' is not a valid provider reference",
            reference
        )));
    }
    Ok(reference)
}

/// Generate a provider reference for gateways that let the merchant choose one
pub fn generate_reference() -> String {
    format!("coin_{}", uuid::Uuid::new_v4().simple())
}

/// Convert a major-unit amount to the provider's smallest unit (kobo, cents)
pub fn to_minor_units(amount: Decimal) -> PaymentResult<i64> {
    let minor = amount * Decimal::ONE_HUNDRED;
    if minor.fract() != Decimal::ZERO {
        return Err(PaymentError::InvalidRequest(format!(
            "amount {} has more than two decimal places",
            amount
        )));
    }
    minor
        .to_i64()
        .ok_or_else(|| PaymentError::InvalidRequest(format!("amount {} is out of range", amount)))
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Read a decimal from a JSON number or numeric string
pub fn decimal_from_value(value: Option<&Value>) -> Decimal {
    match value {
        Some(Value::Number(n)) => n.to_string().parse().unwrap_or(Decimal::ZERO),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}
