//! waf-runtime CLI entry point.
//!
//! Loads the configuration, compiles the guest module and serves a
//! placeholder application behind the request filter.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::Router;
use axum::http::StatusCode;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use waf_runtime_common::ConfigFile;
use waf_runtime_host::RuntimeHandle;
use waf_runtime_server::{ServerConfig, WafServer};

/// Request filter driven by a WebAssembly guest module.
#[derive(Debug, Parser)]
#[command(name = "waf-runtime", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "WAF_CONFIG")]
    config: Option<PathBuf>,

    /// Guest module, overriding `[guest] path`.
    #[arg(short, long, env = "WAF_GUEST")]
    guest: Option<PathBuf>,

    /// Listen address, overriding `[server] bind_addr`.
    #[arg(short, long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Fmt, env = "WAF_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines.
    Fmt,
    /// One JSON object per event.
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,waf_runtime=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Fmt => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Stand-in for the protected application.
fn placeholder_app() -> Router {
    Router::new().fallback(|| async { (StatusCode::OK, "OK\n") })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting waf-runtime");

    // Load configuration
    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    let mut server_config = ServerConfig::from_file_section(&file.server)?;
    if let Some(bind) = cli.bind {
        server_config = server_config.with_bind_addr(bind);
    }

    let guest = cli
        .guest
        .or_else(|| file.guest.path.as_ref().map(PathBuf::from))
        .context("No guest module configured. Pass --guest or set [guest] path")?;

    info!(
        guest = %guest.display(),
        bind_addr = %server_config.bind_addr,
        blocked_countries = file.filter.blocked_countries.len(),
        "Configuration loaded"
    );

    // Compile the guest; a corrupt binary stops here
    let runtime = RuntimeHandle::from_file(&file.runtime, &file.dns, &guest)
        .with_context(|| format!("Failed to load guest module {}", guest.display()))?;

    let server = WafServer::new(runtime, file.filter, server_config, placeholder_app());

    info!("Server initialized. Available endpoints:");
    info!("  GET  /health              - Health check");
    info!("  GET  /ready               - Readiness check");
    info!("  *    /*                   - Filtered application");

    server.run().await?;

    Ok(())
}
