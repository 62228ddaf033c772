//! Axum HTTP handlers for the web server
//!
//! The `/mcp` handlers hand every request to the session router; the
//! remaining endpoints are static metadata.

use axum::{body::Bytes, extract::State, http::HeaderMap, response::Response, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub transport: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: "/mcp",
        transport: "streamable-http",
    })
}

pub async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    state.router.handle_post(&headers, body).await
}

pub async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.router.handle_get(&headers)
}

pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.router.handle_delete(&headers)
}
