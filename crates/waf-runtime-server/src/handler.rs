//! Health and readiness handlers.
//!
//! These routes are served without going through the request filter.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::state::AppState;

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Returns 200 OK with pool occupancy while guest verdicts can be had, and
/// 503 once the runtime has been closed.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let analyzer = state.analyzer();
    let classifier = analyzer.classifier();
    let ready = classifier.is_ready();

    let body = serde_json::json!({
        "status": if ready { "ready" } else { "closed" },
        "pool": classifier.pool_stats(),
        "verified_bots": analyzer.allowed_bots().len(),
    });

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, axum::Json(body))
}
