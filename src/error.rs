//! Error taxonomy for the payment and crediting paths
//!
//! Every failure a caller can observe is one of these variants. Provider and
//! store errors never leak as-is: they are folded into a variant and, where
//! useful for diagnostics, attached as `details`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::database::error::DatabaseError;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    /// Missing or malformed input on initiate / confirm
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported payment gateway: {0}")]
    UnsupportedGateway(String),

    #[error("No coin account for user {0}")]
    AccountNotFound(String),

    /// Provider call failed, timed out or returned a non-success status
    #[error("{provider} is unavailable: {message}")]
    UpstreamUnavailable {
        provider: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Provider reports the transaction did not succeed
    #[error("Payment not approved (provider status: {status})")]
    NotApproved { status: String },

    /// Payment may have succeeded but the user or coin amount cannot be recovered
    #[error("Payment metadata incomplete: {0}")]
    MissingMetadata(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// The atomic credit lost its race more times than allowed
    #[error("Ledger write conflict persisted after {attempts} attempts")]
    StoreConflict { attempts: u32 },

    #[error("Ledger store error: {0}")]
    Store(#[from] DatabaseError),
}

impl PaymentError {
    pub fn upstream(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            provider: provider.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::InvalidRequest(_) => "INVALID_REQUEST",
            PaymentError::UnsupportedGateway(_) => "UNSUPPORTED_GATEWAY",
            PaymentError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            PaymentError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            PaymentError::NotApproved { .. } => "NOT_APPROVED",
            PaymentError::MissingMetadata(_) => "MISSING_METADATA",
            PaymentError::InvalidSignature => "INVALID_SIGNATURE",
            PaymentError::StoreConflict { .. } => "STORE_CONFLICT",
            PaymentError::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    /// Whether the same call may succeed if repeated unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::UpstreamUnavailable { .. } | PaymentError::StoreConflict { .. } => true,
            PaymentError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PaymentError::UnsupportedGateway(_) | PaymentError::AccountNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PaymentError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            PaymentError::NotApproved { .. } => StatusCode::PAYMENT_REQUIRED,
            PaymentError::MissingMetadata(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PaymentError::InvalidSignature => StatusCode::UNAUTHORIZED,
            PaymentError::StoreConflict { .. } | PaymentError::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Store internals stay in the logs
        let message = match &self {
            PaymentError::Store(e) => {
                tracing::error!(error = %e, "ledger store failure");
                "Ledger temporarily unavailable, please retry".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "success": false,
            "message": message,
            "code": self.code(),
            "retryable": self.is_retryable(),
        });

        match self {
            PaymentError::MissingMetadata(_) => {
                body["needsManualReview"] = json!(true);
            }
            PaymentError::UpstreamUnavailable {
                details: Some(details),
                ..
            } => {
                body["details"] = details;
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
