use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::clock::SystemClock;
use super::db::{DbHandle, FactoryDb};
use super::ws;
use crate::config::FactoryConfig;

/// Configuration for the factory server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub db_path: PathBuf,
    pub busy_timeout: Duration,
    pub poll_interval: Duration,
    pub seed_catalog: bool,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            host: "127.0.0.1".to_string(),
            db_path: PathBuf::from(".factory/factory.db"),
            busy_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(1000),
            seed_catalog: false,
            dev_mode: false,
        }
    }
}

impl From<&FactoryConfig> for ServerConfig {
    fn from(config: &FactoryConfig) -> Self {
        Self {
            port: config.server.port,
            host: config.server.host.clone(),
            db_path: config.database.path.clone(),
            busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
            poll_interval: Duration::from_millis(config.simulation.poll_interval_ms),
            seed_catalog: config.simulation.seed_catalog,
            dev_mode: config.server.dev_mode,
        }
    }
}

/// Build the full application router with API and WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_tx = state.ws_tx.clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| ws::ws_handler_with_sender(ws_upgrade, ws_tx)),
        )
        .with_state(state)
}

/// Start the factory server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let db = FactoryDb::with_busy_timeout(&config.db_path, config.busy_timeout)
        .context("Failed to initialize factory database")?;
    if config.seed_catalog {
        let seeded = db.seed_default_catalog()?;
        tracing::info!(seeded, "default process catalog seeded");
    }
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let state = Arc::new(AppState::new(
        DbHandle::new(db),
        Arc::new(SystemClock),
        ws_tx,
        config.poll_interval,
    ));

    let mut app = build_router(state.clone()).layer(TraceLayer::new_for_http());

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { config.host.as_str() };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db = %config.db_path.display(), "factory line server listening");
    println!("Factory line running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.driver.stop_all().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
