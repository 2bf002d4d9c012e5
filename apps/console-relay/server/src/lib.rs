//! Console session broker and WebSocket relay.
//!
//! Callers ask for a console on one cluster resource and receive a short-lived
//! single-use session id. Redeeming it on `/ws/console/{id}` opens an upstream
//! console WebSocket to the cluster manager and relays frames both ways.

pub mod access;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod failover;
pub mod inventory;
pub mod issuer;
pub mod relay;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

use crate::{
    cluster::HttpClusterClient,
    config::ServerConfig,
    credentials::CredentialStore,
    failover::{EndpointResolver, FailoverLocks, NodeEndpointCache},
    inventory::Inventory,
    issuer::SessionIssuer,
    relay::RelayState,
    session::SessionStore,
    state::AppState,
    upstream::TungsteniteConnector,
};

/// Wires every registry and client for one process.
pub fn build_state(
    config: &ServerConfig,
    inventory: &Inventory,
    metrics: PrometheusHandle,
) -> Result<AppState> {
    let connections = Arc::new(inventory.connections().context("invalid inventory connections")?);
    let policy = Arc::new(inventory.access_policy().context("invalid inventory users")?);
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(inventory.credential_store(config.credential_key.clone()));

    let resolver = EndpointResolver::new(
        NodeEndpointCache::new(config.node_cache_ttl),
        FailoverLocks::new(config.failover_lock_ttl),
    );
    let cluster = HttpClusterClient::new(Arc::clone(&credentials), resolver, config.cluster.clone())
        .context("failed to build cluster REST client")?;

    let sessions = SessionStore::new(config.session.clone());
    let issuer = SessionIssuer::new(
        policy.clone(),
        connections,
        Arc::new(cluster),
        sessions.clone(),
    );
    let relay = RelayState::new(sessions.clone(), Arc::new(TungsteniteConnector::new(credentials)))
        .with_connect_timeout(config.upstream_connect_timeout);

    Ok(AppState {
        issuer,
        policy,
        relay,
        sessions,
        metrics,
    })
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    upstream::ensure_rustls_provider();
    let inventory = Inventory::load(&config.inventory_path).with_context(|| {
        format!("failed to load inventory {}", config.inventory_path.display())
    })?;
    let state = build_state(&config, &inventory, metrics)?;
    info!(
        connections = inventory.connections.len(),
        users = inventory.users.len(),
        "inventory loaded"
    );

    let sweeper = state.sessions.spawn_sweeper();
    let router = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("console-relay listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    sweeper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
