//! HTTP layer for waf-runtime.
//!
//! This crate puts the guest-driven request filter in front of an Axum
//! application. It handles:
//!
//! - Client metadata and per-request snapshots
//! - Local pre-filters and the verified bot cache
//! - The fail-open analysis policy
//! - The blocked response
//! - Health and readiness checks, serving and graceful shutdown
//!
//! # Quick Start
//!
//! ```ignore
//! use axum::Router;
//! use waf_runtime_common::{DnsConfig, FilterConfig, RuntimeConfig};
//! use waf_runtime_host::RuntimeHandle;
//! use waf_runtime_server::{ServerConfig, WafServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = RuntimeHandle::from_file(
//!         &RuntimeConfig::default(),
//!         &DnsConfig::default(),
//!         "guest.wasm",
//!     )?;
//!     let app = Router::new().fallback(|| async { "OK" });
//!
//!     let server = WafServer::new(runtime, FilterConfig::default(), ServerConfig::default(), app);
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod allowed_bots;
pub mod analyzer;
pub mod blocked;
pub mod client;
pub mod handler;
pub mod middleware;
pub mod prefilter;
pub mod request;
pub mod router;
pub mod server;
pub mod state;

pub use allowed_bots::AllowedBotIps;
pub use analyzer::{Classifier, RequestAnalyzer, Verdict, on_error};
pub use blocked::{BLOCKED_BODY, BlockDelay, blocked_response};
pub use client::ClientInfo;
pub use prefilter::{BlockReason, Screened};
pub use request::RequestSnapshot;
pub use router::build_router;
pub use server::{ServerConfig, TestHandle, WafServer};
pub use state::AppState;
