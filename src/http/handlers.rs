//! Axum HTTP handlers for the web server
//!
//! Health and discovery metadata, plus the upgrade endpoint that hands each accepted socket to
//! the connection engine.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::Uri,
    response::Response,
    Json,
};
use serde::Serialize;
use tracing::debug;

use crate::mcp::registry::HandlerKind;
use crate::server::ServerHandle;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub websocket_endpoint: String,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub connections: usize,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    let registry = state.server.registry();
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        websocket_endpoint: state.ws_path.to_string(),
        tools: registry.count(HandlerKind::Tool),
        resources: registry.count(HandlerKind::Resource),
        prompts: registry.count(HandlerKind::Prompt),
        connections: state.server.connections().len(),
    })
}

pub async fn websocket_endpoint(
    State(server): State<ServerHandle>,
    uri: Uri,
    upgrade: WebSocketUpgrade,
) -> Response {
    let path = uri.path().to_string();
    debug!(path = %path, "upgrading to websocket");
    upgrade.on_upgrade(move |socket| async move { server.serve_channel(socket, &path).await })
}
