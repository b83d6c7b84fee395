//! Axum middleware running the request filter.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::error;

use crate::analyzer::Verdict;
use crate::blocked::delayed_blocked_response;
use crate::client::ClientInfo;
use crate::request::RequestSnapshot;
use crate::state::AppState;

/// Filter one request, then forward it or answer with the blocked response.
///
/// Install with `axum::middleware::from_fn_with_state`. A request without
/// client metadata cannot be analyzed and is forwarded.
pub async fn filter_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(client) = ClientInfo::from_request(&request) else {
        error!(path = %request.uri().path(), "No client address for request, forwarding request");
        return next.run(request).await;
    };

    let snapshot = RequestSnapshot::from_request(&request, client);

    match state.analyzer().analyze(&snapshot).await {
        Verdict::Forward => next.run(request).await,
        Verdict::Block(_) => delayed_blocked_response(state.block_delay()).await,
    }
}
