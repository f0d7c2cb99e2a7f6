use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::hardening::CircuitState;
use crate::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub circuit_breaker: CircuitState,
    pub total_requests: u64,
    pub failed_requests: u64,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// The upstream credential is checked at startup, so readiness tracks the breaker.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let breaker = state.circuit_breaker.state().await;
    let ready = breaker != CircuitState::Open;
    if !ready {
        tracing::warn!("Readiness check: circuit breaker open");
    }

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            circuit_breaker: breaker,
            total_requests: state.health.total_requests.load(Ordering::Relaxed),
            failed_requests: state.health.failed_requests.load(Ordering::Relaxed),
        }),
    )
}
