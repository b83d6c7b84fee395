//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with the
//! health routes and the filtered application.

use std::time::Duration;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::{health_check, readiness_check};
use crate::middleware::filter_request;
use crate::state::AppState;

/// Build the main application router.
///
/// Routes:
/// - `GET /health` - Health check, unfiltered
/// - `GET /ready` - Readiness check with pool statistics, unfiltered
/// - everything routed by `app`, each request passing the filter first
///
/// `app` must not route `/health` or `/ready` itself.
///
/// `request_timeout` bounds the application handler only. The filter sits
/// outside it, so a slow analysis is forwarded instead of answered with
/// `408 Request Timeout`; the analysis has its own deadline.
pub fn build_router(state: AppState, app: Router, request_timeout: Duration) -> Router {
    // Filtered application routes
    let protected = app
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn_with_state(state.clone(), filter_request));

    // Health and monitoring routes
    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
}
