use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::ledger::Gateway;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub environment: String,
    pub ledger: LedgerHealth,
    pub gateways: Vec<Gateway>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerHealth {
    pub backend: String,
    pub reachable: bool,
}

/// Liveness plus a ledger store probe. A failed probe reports `degraded`
/// with 503 so load balancers stop routing confirmations here.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let version = env!("CARGO_PKG_VERSION").to_string();

    let reachable = match state.store().health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "ledger health probe failed");
            false
        }
    };

    let mut gateways: Vec<Gateway> = state.providers.keys().copied().collect();
    gateways.sort();

    let response = HealthResponse {
        status: if reachable { "healthy" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        version,
        environment: state.config.server.environment.clone(),
        ledger: LedgerHealth {
            backend: state.store().backend().to_string(),
            reachable,
        },
        gateways,
    };

    let status = if reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
