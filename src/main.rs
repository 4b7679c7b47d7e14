//! ChatGPT Gateway - Main Entry Point
//!
//! A pass-through gateway that:
//! 1. Republishes the ChatGPT web API as plain REST endpoints
//! 2. Logs users in through the scripted auth0 credential flow
//! 3. Keeps the upstream session warm via a remote browser
//!
//! # Architecture
//!
//! ```text
//! Client ──HTTP──▶ Gateway (this) ──HTTPS──▶ chat.openai.com/backend-api
//!                    │
//!                    ├── Request Forwarder (byte-for-byte relay)
//!                    ├── Credential Login (auth0 redirect walk)
//!                    ├── Session Store (cookies + token, in-memory)
//!                    └── Session Keeper (WebDriver hub, optional)
//! ```

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatgpt_gateway::admission::AdmissionGate;
use chatgpt_gateway::browser::{SessionKeeper, WebDriverClient};
use chatgpt_gateway::config::GatewayConfig;
use chatgpt_gateway::login::{LoginEndpoints, LoginFlow};
use chatgpt_gateway::routes::{AppState, build_router};
use chatgpt_gateway::session::SessionStore;
use chatgpt_gateway::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatgpt_gateway=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 ChatGPT Gateway starting...");

    // Load configuration
    let config = GatewayConfig::from_env()?;
    info!("📋 Configuration loaded");

    // Create shared state
    let store = SessionStore::new();
    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_api_url.clone(),
        store.clone(),
        config.network_proxy.as_deref(),
    )?);
    let login = Arc::new(LoginFlow::new(
        LoginEndpoints::default(),
        store.clone(),
        config.network_proxy.as_deref(),
    )?);
    let state = AppState {
        upstream,
        login,
        gate: AdmissionGate::new(),
        store: store.clone(),
    };

    // Spawn the browser session keeper if a hub is configured
    let keeper_task = match &config.browser_hub_url {
        Some(hub_url) => {
            let browser = Arc::new(WebDriverClient::new(hub_url, config.network_proxy.clone())?);
            let keeper = SessionKeeper::new(browser, store);
            info!("🖥️ Browser session keeper using hub {}", hub_url);
            Some(tokio::spawn(async move {
                if let Err(e) = keeper.start().await {
                    error!("Failed to start browser session: {}", e);
                    return;
                }
                keeper.run().await;
            }))
        }
        None => {
            info!("⏭️ Browser session keeper disabled");
            None
        }
    };

    // Serve the gateway
    let addr: SocketAddr = config.gateway_addr.parse()?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌐 Gateway listening on {}", config.gateway_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Graceful shutdown
    info!("🛑 Shutting down...");
    if let Some(task) = keeper_task {
        task.abort();
    }

    info!("✅ ChatGPT Gateway stopped");
    Ok(())
}

/// Resolves once Ctrl+C arrives
async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("📢 Shutdown signal received"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }
}
