//! HTTP endpoints for health checks and relay info.

use anyhow::Result;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tracing::{debug, info};

use crate::relay::Relay;

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Start an HTTP server exposing `/healthz` and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listening");
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .with_state(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    debug!("GET /healthz");
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Minimal NIP-11 relay information document, extended with live counters.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    /// Human-readable relay name.
    name: String,
    /// Software identifier (here it is always "relayd").
    software: String,
    /// Semantic version string such as "0.1.0".
    version: String,
    /// Protocol documents the relay implements.
    supported_nips: Vec<u32>,
    /// Kinds answered directly by job handlers.
    service_kinds: Vec<u32>,
    /// Open WebSocket connections.
    connections: usize,
    /// Live subscriptions across all connections.
    subscriptions: usize,
    /// Connections holding at least one subscription.
    subscribers: usize,
}

/// Basic NIP-11 relay information document.
async fn relay_info(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    debug!("GET /");
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "relayd".into(),
            software: "relayd".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 11, 90],
            service_kinds: relay.services().kinds(),
            connections: relay.connection_count(),
            subscriptions: relay.registry().len(),
            subscribers: relay.registry().connection_count(),
        }),
    )
}
