//! Payment endpoints
//!
//! Initiate hands the caller a provider session. Confirm and webhook both end
//! in the same place: a Confirmation Event applied once through the
//! [`CreditApplier`](crate::ledger::CreditApplier).

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::api::AppState;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::credit::CreditReceipt;
use crate::ledger::CreditOutcome;
use crate::payments::types::validate_reference;
use crate::payments::{PaymentRequest, PaymentSession};

/// Names a provider reference travels under in redirects and request bodies:
/// Paystack uses `reference`/`trxref`, Stripe `payment_intent`, Chapa `tx_ref`.
const REFERENCE_KEYS: [&str; 7] = [
    "reference",
    "trxref",
    "paymentIntentId",
    "payment_intent",
    "intentId",
    "tx_ref",
    "trx_ref",
];

#[derive(Debug, Serialize)]
pub struct InitiateResponse {
    pub success: bool,
    #[serde(flatten)]
    pub session: PaymentSession,
}

/// Identical for first-time and repeated confirmations of one payment
#[derive(Debug, Serialize)]
pub struct CreditResponse {
    pub success: bool,
    #[serde(flatten)]
    pub receipt: CreditReceipt,
}

impl From<CreditOutcome> for CreditResponse {
    fn from(outcome: CreditOutcome) -> Self {
        Self {
            success: true,
            receipt: outcome.into_receipt(),
        }
    }
}

#[instrument(skip(state, body))]
pub async fn initiate(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    body: Result<Json<PaymentRequest>, JsonRejection>,
) -> PaymentResult<Json<InitiateResponse>> {
    let provider = state.provider(&gateway)?;
    let Json(request) = body.map_err(|e| PaymentError::InvalidRequest(e.body_text()))?;

    let session = provider.initiate_payment(request).await?;
    info!(
        gateway = %session.gateway,
        reference = %session.reference,
        "payment session created"
    );

    Ok(Json(InitiateResponse {
        success: true,
        session,
    }))
}

/// `GET /payments/:gateway/confirm?reference=...`, also the provider redirect target
#[instrument(skip(state, query))]
pub async fn confirm_by_query(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> PaymentResult<Json<CreditResponse>> {
    let reference = REFERENCE_KEYS
        .iter()
        .find_map(|k| query.get(*k))
        .ok_or_else(|| PaymentError::InvalidRequest("reference is required".to_string()))?;

    confirm_reference(&state, &gateway, reference).await
}

/// `POST /payments/:gateway/confirm`
///
/// A `{reference}` body pulls the final status from the provider. A body that
/// looks like a provider event (`event` or `type` at the top level) is
/// treated as a webhook delivery and must carry a valid signature.
#[instrument(skip(state, headers, body))]
pub async fn confirm(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> PaymentResult<Response> {
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| PaymentError::InvalidRequest(format!("malformed JSON body: {}", e)))?;

    if parsed.get("event").is_some() || parsed.get("type").is_some() {
        return webhook(State(state), Path(gateway), headers, body).await;
    }

    let reference = REFERENCE_KEYS
        .iter()
        .find_map(|k| parsed.get(*k).and_then(Value::as_str))
        .ok_or_else(|| PaymentError::InvalidRequest("reference is required".to_string()))?;

    Ok(confirm_reference(&state, &gateway, reference)
        .await?
        .into_response())
}

/// `POST /payments/:gateway/webhook`: signature first, then parse, then credit
#[instrument(skip(state, headers, body), fields(bytes = body.len()))]
pub async fn webhook(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> PaymentResult<Response> {
    let provider = state.provider(&gateway)?;

    let event = match provider.handle_webhook(&headers, &body) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(Json(json!({"success": true, "ignored": true})).into_response()),
        // The provider will not change its mind; acknowledge so it stops redelivering
        Err(PaymentError::NotApproved { status }) => {
            info!(
                gateway = %provider.gateway(),
                %status,
                "webhook for unapproved payment ignored"
            );
            let ack = json!({"success": true, "ignored": true, "status": status});
            return Ok(Json(ack).into_response());
        }
        Err(e) => return Err(e),
    };

    let outcome = state.credits.apply(&event).await.map_err(|e| {
        warn!(key = %event.key(), error = %e, "webhook credit failed");
        e
    })?;
    Ok(Json(CreditResponse::from(outcome)).into_response())
}

async fn confirm_reference(
    state: &AppState,
    gateway: &str,
    reference: &str,
) -> PaymentResult<Json<CreditResponse>> {
    let provider = state.provider(gateway)?;
    let reference = validate_reference(reference)?;

    let event = provider.verify_payment(reference).await?;
    if event.reference != reference {
        warn!(
            requested = reference,
            returned = %event.reference,
            "provider returned a different reference than requested"
        );
    }

    let outcome = state.credits.apply(&event).await?;
    Ok(Json(CreditResponse::from(outcome)))
}
