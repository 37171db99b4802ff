//! HTTP surface tests against the real router, an in-memory ledger and a
//! scripted payment provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use coinpay_backend::api::{build_router, AppState};
use coinpay_backend::config::{
    Config, LedgerBackend, LedgerConfig, LogFormat, ProvidersConfig, ServerConfig,
};
use coinpay_backend::error::{PaymentError, PaymentResult};
use coinpay_backend::ledger::{Gateway, MemoryLedger};
use coinpay_backend::payments::providers::{ChapaConfig, ChapaProvider, ProviderRegistry};
use coinpay_backend::payments::signature::sign_hmac_sha256_hex;
use coinpay_backend::payments::types::{
    from_minor_units, ConfirmationEvent, PaymentRequest, PaymentSession, ProviderConfirmation,
};
use coinpay_backend::payments::PaymentProvider;

const CHAPA_WEBHOOK_SECRET: &str = "chapa-hook-secret";

/// Card-regional stand-in whose verify endpoint serves canned transactions
struct ScriptedProvider {
    transactions: HashMap<String, Value>,
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn gateway(&self) -> Gateway {
        Gateway::CardRegional
    }

    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentSession> {
        request.validate()?;
        Ok(PaymentSession {
            gateway: Gateway::CardRegional,
            reference: request.reference_or_generate(),
            authorization_url: Some("https://checkout.example/pay".to_string()),
            access_code: Some("acc_1".to_string()),
            client_secret: None,
            provider_data: None,
        })
    }

    async fn fetch_confirmation(&self, reference: &str) -> PaymentResult<Value> {
        if reference == "ref-outage" {
            return Err(PaymentError::upstream("Scripted", "HTTP 503"));
        }
        self.transactions
            .get(reference)
            .cloned()
            .ok_or_else(|| PaymentError::upstream("Scripted", "HTTP 404"))
    }

    fn parse_confirmation(&self, payload: &Value) -> PaymentResult<ConfirmationEvent> {
        ProviderConfirmation {
            gateway: Gateway::CardRegional,
            success_status: "success",
            status: payload.get("status").and_then(Value::as_str),
            reference: payload.get("reference").and_then(Value::as_str),
            metadata: payload.get("metadata"),
            gross_amount: from_minor_units(payload["amount"].as_i64().unwrap_or(0)),
            currency: Some("NGN"),
            extras: Default::default(),
        }
        .into_event()
    }

    fn validate_webhook_signature(
        &self,
        headers: &HeaderMap,
        _payload: &[u8],
    ) -> PaymentResult<()> {
        match headers.get("x-test-signature") {
            Some(v) if v == "valid" => Ok(()),
            _ => Err(PaymentError::InvalidSignature),
        }
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<Option<ConfirmationEvent>> {
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidRequest(e.to_string()))?;
        if body["event"] != "charge.success" {
            return Ok(None);
        }
        self.parse_confirmation(&body["data"]).map(Some)
    }
}

fn transaction(reference: &str, status: &str, metadata: Value) -> Value {
    json!({
        "reference": reference,
        "status": status,
        "amount": 250000,
        "metadata": metadata,
    })
}

fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            environment: "development".to_string(),
            log_format: LogFormat::Pretty,
            cors_allowed_origins: Vec::new(),
        },
        ledger: LedgerConfig {
            backend: LedgerBackend::Memory,
            database_url: None,
            max_connections: 5,
            credit_max_attempts: 5,
            credit_retry_backoff: Duration::from_millis(1),
        },
        providers: ProvidersConfig::default(),
    }
}

fn setup() -> (Router, Arc<MemoryLedger>) {
    let mut transactions = HashMap::new();
    for (reference, status, metadata) in [
        ("ref-1", "success", json!({"userId": "U1", "coins": 50})),
        ("ref-2", "success", json!({"userId": "U1", "coins": 25})),
        ("ref-failed", "failed", json!({"userId": "U1", "coins": 50})),
        ("ref-nometa", "success", json!({"packageName": "gold"})),
    ] {
        transactions.insert(reference.to_string(), transaction(reference, status, metadata));
    }

    let mut providers: ProviderRegistry = HashMap::new();
    providers.insert(
        Gateway::CardRegional,
        Arc::new(ScriptedProvider { transactions }),
    );
    providers.insert(
        Gateway::MobileMoney,
        Arc::new(
            ChapaProvider::new(ChapaConfig {
                secret_key: "CHASECK_TEST".to_string(),
                webhook_secret: CHAPA_WEBHOOK_SECRET.to_string(),
                ..Default::default()
            })
            .unwrap(),
        ),
    );

    let ledger = Arc::new(MemoryLedger::new());
    let state = AppState::new(test_config(), providers, ledger.clone());
    (build_router(state).unwrap(), ledger)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_ledger_and_gateways() {
    let (app, _) = setup();
    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["ledger"]["backend"], "memory");
    assert_eq!(body["gateways"], json!(["card-regional", "mobile-money"]));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn initiate_returns_session_handle() {
    let (app, _) = setup();
    let (status, body) = send(
        &app,
        post_json(
            "/payments/paystack/initiate",
            json!({
                "email": "buyer@example.com",
                "amount": "2500",
                "reference": "ref-new",
                "metadata": {"userId": "U1", "coins": 50}
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["reference"], "ref-new");
    assert_eq!(body["authorizationUrl"], "https://checkout.example/pay");
    assert_eq!(body["gateway"], "card-regional");
}

#[tokio::test]
async fn initiate_without_payer_is_invalid_request() {
    let (app, _) = setup();
    let (status, body) = send(
        &app,
        post_json(
            "/payments/card-regional/initiate",
            json!({"amount": "10", "metadata": {"userId": "U1", "coins": 5}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn malformed_initiate_body_uses_error_envelope() {
    let (app, _) = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/payments/card-regional/initiate")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn unknown_or_disabled_gateway_is_not_found() {
    let (app, _) = setup();
    for uri in [
        "/payments/paypal/confirm?reference=ref-1",
        "/payments/stripe/confirm?reference=ref-1",
    ] {
        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(body["code"], "UNSUPPORTED_GATEWAY");
    }
}

#[tokio::test]
async fn confirm_credits_once_and_repeats_are_identical() {
    let (app, ledger) = setup();

    let (status, first) = send(&app, get("/payments/card-regional/confirm?reference=ref-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["success"], true);
    assert_eq!(first["newBalance"], 50);
    assert_eq!(first["coins"], 50);
    assert_eq!(first["userId"], "U1");

    // Redirect-style query and POST body both hit the same payment
    let (_, by_trxref) =
        send(&app, get("/payments/paystack/confirm?trxref=ref-1&reference=ref-1")).await;
    let (_, by_post) = send(
        &app,
        post_json("/payments/card-regional/confirm", json!({"reference": "ref-1"})),
    )
    .await;
    assert_eq!(by_trxref, first);
    assert_eq!(by_post, first);

    let (_, account) = send(&app, get("/accounts/U1")).await;
    assert_eq!(account["balance"], 50);
    assert_eq!(account["history"].as_array().unwrap().len(), 1);
    assert_eq!(ledger.applied_count().await, 1);
}

#[tokio::test]
async fn balance_accumulates_across_payments() {
    let (app, _) = setup();
    send(&app, get("/payments/card-regional/confirm?reference=ref-1")).await;
    let (_, second) = send(&app, get("/payments/card-regional/confirm?reference=ref-2")).await;
    assert_eq!(second["newBalance"], 75);
}

#[tokio::test]
async fn failed_payment_is_not_approved() {
    let (app, ledger) = setup();
    let (status, body) =
        send(&app, get("/payments/card-regional/confirm?reference=ref-failed")).await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "NOT_APPROVED");
    assert_eq!(body["retryable"], false);
    assert_eq!(ledger.applied_count().await, 0);
}

#[tokio::test]
async fn missing_metadata_asks_for_manual_review() {
    let (app, ledger) = setup();
    let (status, body) =
        send(&app, get("/payments/card-regional/confirm?reference=ref-nometa")).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["needsManualReview"], true);
    assert_eq!(ledger.applied_count().await, 0);
}

#[tokio::test]
async fn provider_outage_is_retryable_bad_gateway() {
    let (app, _) = setup();
    let (status, body) =
        send(&app, get("/payments/card-regional/confirm?reference=ref-outage")).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "UPSTREAM_UNAVAILABLE");
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn confirm_requires_a_well_formed_reference() {
    let (app, _) = setup();
    let (status, _) = send(&app, get("/payments/card-regional/confirm")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json("/payments/card-regional/confirm", json!({"reference": "../../admin"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsigned_webhook_is_rejected() {
    let (app, ledger) = setup();
    let data = transaction("ref-9", "success", json!({"userId": "U9", "coins": 9}));
    let body = json!({"event": "charge.success", "data": data});
    let (status, response) = send(&app, post_json("/payments/card-regional/webhook", body)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["code"], "INVALID_SIGNATURE");
    assert_eq!(ledger.applied_count().await, 0);
}

#[tokio::test]
async fn event_body_posted_to_confirm_is_treated_as_webhook() {
    let (app, _) = setup();
    let data = transaction("ref-9", "success", json!({"userId": "U9", "coins": 9}));
    let body = json!({"event": "charge.success", "data": data});

    let (status, _) = send(&app, post_json("/payments/card-regional/confirm", body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut request = post_json("/payments/card-regional/confirm", body);
    request
        .headers_mut()
        .insert("x-test-signature", "valid".parse().unwrap());
    let (status, response) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["newBalance"], 9);
}

#[tokio::test]
async fn signed_chapa_webhook_credits_and_redelivery_is_duplicate() {
    let (app, _) = setup();
    let payload = json!({
        "event": "charge.success",
        "status": "success",
        "tx_ref": "coin_eth_1",
        "amount": "300.00",
        "currency": "ETB",
        "meta": {"userId": "ETH1", "coins": 60}
    })
    .to_string();
    let signature = sign_hmac_sha256_hex(CHAPA_WEBHOOK_SECRET.as_bytes(), payload.as_bytes());

    let build = || {
        Request::builder()
            .method("POST")
            .uri("/payments/mobile-money/webhook")
            .header("content-type", "application/json")
            .header("x-chapa-signature", signature.as_str())
            .body(Body::from(payload.clone()))
            .unwrap()
    };

    let (status, first) = send(&app, build()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["newBalance"], 60);

    let (status, again) = send(&app, build()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, first);
}

#[tokio::test]
async fn unrelated_webhook_events_are_acknowledged() {
    let (app, ledger) = setup();
    let mut request = post_json(
        "/payments/card-regional/webhook",
        json!({"event": "transfer.success", "data": {}}),
    );
    request
        .headers_mut()
        .insert("x-test-signature", "valid".parse().unwrap());

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ignored"], true);
    assert_eq!(ledger.applied_count().await, 0);
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let (app, _) = setup();
    let (status, body) = send(&app, get("/accounts/nobody")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ACCOUNT_NOT_FOUND");
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let (app, _) = setup();
    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
