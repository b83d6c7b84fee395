//! The response served to blocked requests.
//!
//! Every blocked request gets the same body and headers after a random
//! delay, whatever the reason it was blocked for.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use rand::Rng;

use waf_runtime_common::FilterConfig;

/// Body of the blocked response.
pub const BLOCKED_BODY: &str = "Access denied\n";

/// Uniformly random delay applied before answering a blocked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDelay {
    min_ms: u64,
    max_ms: u64,
}

impl BlockDelay {
    /// Delay between `min_ms` and `max_ms` milliseconds, both inclusive.
    ///
    /// A maximum below the minimum is raised to it.
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    /// Delay bounds from the filter configuration.
    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.block_delay_min_ms, config.block_delay_max_ms)
    }

    /// No delay at all.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Draw one delay.
    pub fn sample(&self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }

    /// Lower bound.
    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    /// Upper bound.
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Wait for one sampled delay, then build the blocked response.
pub async fn delayed_blocked_response(delay: BlockDelay) -> Response {
    tokio::time::sleep(delay.sample()).await;
    blocked_response()
}

/// `403 Forbidden` with a fixed text body, no caching and a closed
/// connection.
pub fn blocked_response() -> Response {
    let headers = [
        (header::CONNECTION, HeaderValue::from_static("close")),
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        ),
        (header::CONTENT_LENGTH, HeaderValue::from(BLOCKED_BODY.len())),
    ];

    let mut response = (StatusCode::FORBIDDEN, headers, BLOCKED_BODY).into_response();
    response.headers_mut().remove(header::ETAG);
    response
}
