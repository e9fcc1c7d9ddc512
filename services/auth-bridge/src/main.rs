//! OAuth authorization bridge
//!
//! Single-binary service that sits between MCP clients and an upstream
//! identity provider:
//! 1. Acts as an OAuth 2.1 authorization server toward downstream clients
//!    (consent, PKCE, its own codes and tokens)
//! 2. Acts as an OAuth/OIDC client toward the configured upstream IdP
//! 3. Bridges token lifetimes: downstream refresh grants lazily refresh
//!    the upstream token when it is near expiry

mod config;
mod downstream;
mod error;
mod handlers;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridge_store::store::{MemoryStore, SessionStore};
use bridge_store::transaction::TransactionManager;

use crate::config::Config;
use crate::downstream::{Issuer, ReferenceIssuer, TokenBridge};
use crate::handlers::{AppState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting auth-bridge");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let provider = config.provider.resolve().map_err(anyhow::Error::from)?;
    info!(
        listen_addr = %config.server.listen_addr,
        provider = %provider.name,
        oidc = provider.use_nonce,
        clients = config.clients.len(),
        callback_url = %config.callback_url(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.provider.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let bridge = Arc::new(TokenBridge::new(
        http.clone(),
        provider.clone(),
        Duration::from_secs(config.provider.refresh_buffer_secs),
    ));
    let issuer: Arc<dyn Issuer> = Arc::new(ReferenceIssuer::new(
        config.clients.clone(),
        store.clone(),
        bridge,
    ));
    let transactions = Arc::new(TransactionManager::new(
        store,
        Duration::from_secs(config.transaction.ttl_secs),
    ));

    let cookie_secret = config
        .consent
        .cookie_secret
        .clone()
        // Config::load rejects a missing cookie secret before we get here
        .context("cookie secret missing after config validation")?;

    let app_state = AppState {
        provider: Arc::new(provider),
        callback_url: Arc::new(config.callback_url()),
        cookie_secret: Arc::new(cookie_secret),
        consent_ttl_secs: config.consent.ttl_secs,
        bind_txn_cookie: config.transaction.bind_cookie,
        secure_cookies: config.server.public_url.starts_with("https://"),
        transactions,
        issuer,
        http,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
