//! HTTP surface
//!
//! Routes:
//! - `GET  /health`
//! - `POST /payments/:gateway/initiate`
//! - `GET|POST /payments/:gateway/confirm`
//! - `POST /payments/:gateway/webhook`
//! - `GET  /accounts/:user_id`

pub mod accounts;
pub mod health;
pub mod payments;

use std::any::Any;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::{header, HeaderValue, Method, StatusCode};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::Config;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{CreditApplier, DynLedgerStore, Gateway};
use crate::payments::providers::ProviderRegistry;
use crate::payments::PaymentProvider;

/// Shared, read-only application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub providers: Arc<ProviderRegistry>,
    pub credits: CreditApplier,
}

impl AppState {
    pub fn new(config: Config, providers: ProviderRegistry, store: DynLedgerStore) -> Self {
        let credits = CreditApplier::new(store).with_retry_policy(
            config.ledger.credit_max_attempts,
            config.ledger.credit_retry_backoff,
        );

        Self {
            config: Arc::new(config),
            providers: Arc::new(providers),
            credits,
        }
    }

    /// Resolve a path segment to an enabled provider
    pub fn provider(&self, raw: &str) -> PaymentResult<Arc<dyn PaymentProvider>> {
        let gateway: Gateway = raw.parse()?;
        self.providers
            .get(&gateway)
            .cloned()
            .ok_or_else(|| PaymentError::UnsupportedGateway(format!("{} is not enabled", gateway)))
    }

    pub fn store(&self) -> &DynLedgerStore {
        self.credits.store()
    }
}

/// Build the application router with all endpoints and middleware
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let cors = create_cors_layer(&state.config)?;

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors);

    let router = Router::new()
        .route("/health", get(health::health_check))
        .route("/payments/:gateway/initiate", post(payments::initiate))
        .route(
            "/payments/:gateway/confirm",
            get(payments::confirm_by_query).post(payments::confirm),
        )
        .route("/payments/:gateway/webhook", post(payments::webhook))
        .route("/accounts/:user_id", get(accounts::get_account))
        .layer(middleware)
        .with_state(state);

    Ok(router)
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if config.server.cors_allowed_origins.is_empty() {
        return Ok(cors.allow_origin(AnyOrigin));
    }

    let mut origins = Vec::new();
    for origin in &config.server.cors_allowed_origins {
        origins.push(origin.parse::<HeaderValue>()?);
    }
    Ok(cors.allow_origin(origins))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "message": "Internal server error",
        })),
    )
        .into_response()
}
