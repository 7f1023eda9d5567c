//! HTTP API and health check endpoints for the zipper.

use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use iroh::Endpoint;

use crate::metrics::SharedMetrics;
use crate::registry::EndpointRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub metrics: SharedMetrics,
    pub endpoint: Endpoint,
    pub registry: EndpointRegistry,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/zipper-addr", get(zipper_addr))
        .route("/api/v1/endpoints", get(list_endpoints))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<ApiState>) -> Response {
    let body = state.metrics.encode().await;
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

async fn zipper_addr(State(state): State<ApiState>) -> impl IntoResponse {
    let addr = bs58::encode(state.endpoint.id().as_bytes()).into_string();
    axum::Json(serde_json::json!({ "addr": addr }))
}

async fn list_endpoints(State(state): State<ApiState>) -> impl IntoResponse {
    axum::Json(state.registry.connected_names())
}
