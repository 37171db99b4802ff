//! Payment provider trait definitions
//!
//! Defines the common interface that all payment providers must implement.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::Value;

use crate::error::PaymentResult;
use crate::ledger::Gateway;
use crate::payments::types::{ConfirmationEvent, PaymentRequest, PaymentSession};

/// Trait for payment provider implementations
///
/// Each gateway (Paystack, Stripe, Chapa) implements this trait. Adapters only
/// talk to their provider and normalise its data; they never touch the ledger.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn gateway(&self) -> Gateway;

    /// Initialize a payment transaction
    ///
    /// Requires a payer identifier and a positive amount. Returns the provider's
    /// session handle (redirect URL or client secret) for the client to use.
    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentSession>;

    /// Fetch the provider's final record of a transaction by reference
    async fn fetch_confirmation(&self, reference: &str) -> PaymentResult<Value>;

    /// Normalise a provider transaction payload into a Confirmation Event
    ///
    /// Fails with `NotApproved` unless the provider status equals its success
    /// value exactly, and with `MissingMetadata` when the user or a positive
    /// coin amount cannot be recovered.
    fn parse_confirmation(&self, payload: &Value) -> PaymentResult<ConfirmationEvent>;

    /// Client-driven verification: pull the final status, then normalise it
    async fn verify_payment(&self, reference: &str) -> PaymentResult<ConfirmationEvent> {
        let payload = self.fetch_confirmation(reference).await?;
        self.parse_confirmation(&payload)
    }

    /// Validate webhook signature
    ///
    /// Verifies that a webhook request is authentic over the exact bytes received.
    fn validate_webhook_signature(&self, headers: &HeaderMap, payload: &[u8]) -> PaymentResult<()>;

    /// Decode an authenticated webhook body
    ///
    /// Returns `None` for event types that do not signal a completed payment.
    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<Option<ConfirmationEvent>>;

    /// Authenticate, then decode. The payload is not inspected before the
    /// signature has been checked.
    fn handle_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> PaymentResult<Option<ConfirmationEvent>> {
        if let Err(e) = self.validate_webhook_signature(headers, payload) {
            tracing::warn!(
                gateway = %self.gateway(),
                "rejected webhook with invalid signature"
            );
            return Err(e);
        }
        self.parse_webhook(payload)
    }
}
