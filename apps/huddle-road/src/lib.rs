pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod registry;
pub mod router;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use crate::auth::{Authenticator, BypassAuthenticator, JwtAuthenticator};
use crate::config::ServerConfig;
use crate::server::SessionServer;
use crate::storage::{MemoryRoomStore, PgRoomStore, RoomStore};
use crate::websocket::{build_router, AppState};

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store: Arc<dyn RoomStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgRoomStore::connect(url)
                .await
                .context("failed to connect to room store")?,
        ),
        None => {
            warn!("DATABASE_URL not set; room records are kept in memory only");
            Arc::new(MemoryRoomStore::new())
        }
    };

    let auth: Arc<dyn Authenticator> = match (&config.jwt_secret, config.auth_bypass) {
        (_, true) => {
            warn!("auth bypass enabled; tokens are not verified");
            Arc::new(BypassAuthenticator)
        }
        (Some(secret), false) => Arc::new(JwtAuthenticator::new(secret.as_bytes())),
        (None, false) => anyhow::bail!("no JWT secret configured"),
    };

    let server = SessionServer::new(store, auth).spawn();
    let router = build_router(AppState { server, metrics });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("huddle-road listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
