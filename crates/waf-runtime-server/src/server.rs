//! HTTP server implementation.
//!
//! This module provides the main [`WafServer`] struct, which serves a
//! protected application behind the request filter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use waf_runtime_common::{FilterConfig, RuntimeError, ServerConfigFile};
use waf_runtime_host::RuntimeHandle;

use crate::router::build_router;
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` section of the configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address does not parse.
    pub fn from_file_section(section: &ServerConfigFile) -> Result<Self, RuntimeError> {
        let bind_addr = section.bind_addr.parse().map_err(|e| {
            RuntimeError::invalid_config(format!(
                "Invalid bind address '{}': {e}",
                section.bind_addr
            ))
        })?;

        Ok(Self {
            bind_addr,
            request_timeout_secs: section.request_timeout_secs,
            graceful_shutdown: section.graceful_shutdown,
        })
    }

    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check that the guest verdict deadline is shorter than the request
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if `filter.analysis_timeout_ms` is not strictly
    /// below the request timeout.
    pub fn check_analysis_timeout(&self, filter: &FilterConfig) -> Result<(), RuntimeError> {
        if filter.analysis_timeout() >= self.request_timeout() {
            return Err(RuntimeError::invalid_config(format!(
                "filter.analysis_timeout_ms ({}) must be below server.request_timeout_secs ({}s)",
                filter.analysis_timeout_ms, self.request_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Filtering HTTP server.
///
/// # Example
///
/// ```ignore
/// use waf_runtime_server::{ServerConfig, WafServer};
///
/// let runtime = RuntimeHandle::from_file(&runtime_config, &dns_config, "guest.wasm")?;
/// let app = Router::new().fallback(|| async { "OK" });
///
/// let server = WafServer::new(runtime, FilterConfig::default(), ServerConfig::default(), app);
/// server.run().await?;
/// ```
pub struct WafServer {
    /// Guest runtime.
    runtime: RuntimeHandle,
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
    /// Application served behind the filter.
    app: Router,
}

impl WafServer {
    /// Create a new server instance.
    pub fn new(
        runtime: RuntimeHandle,
        filter_config: FilterConfig,
        server_config: ServerConfig,
        app: Router,
    ) -> Self {
        let state = AppState::new(Arc::new(runtime.clone()), filter_config);

        Self {
            runtime,
            state,
            config: server_config,
            app,
        }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// Binds the address and instantiates one guest instance before
    /// accepting connections, then blocks until the server is shut down via
    /// signal (SIGTERM/SIGINT) if graceful shutdown is enabled. The runtime
    /// is closed on the way out.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeouts are inconsistent, the server cannot
    /// bind to the address or the guest cannot be instantiated.
    pub async fn run(self) -> Result<(), RuntimeError> {
        self.config
            .check_analysis_timeout(self.state.analyzer().config())?;

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        self.runtime.warm_up().await?;
        let ticker = self.runtime.engine().spawn_epoch_ticker();

        let app = build_router(self.state, self.app, self.config.request_timeout());
        let service = app.into_make_service_with_connect_info::<SocketAddr>();

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        let result = if self.config.graceful_shutdown {
            axum::serve(listener, service)
                .with_graceful_shutdown(shutdown_signal())
                .await
        } else {
            axum::serve(listener, service).await
        };

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        self.runtime.close();

        result.map_err(|e| RuntimeError::invalid_config(format!("Server error: {e}")))?;

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0) and
    /// returns a handle that can be used to get the actual address
    /// and shut down the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_test(state: AppState, app: Router) -> Result<TestHandle, RuntimeError> {
        let app = build_router(state.clone(), app, Duration::from_secs(30));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

impl std::fmt::Debug for WafServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WafServer")
            .field("runtime", &self.runtime)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state.
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Test server task failed");
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
