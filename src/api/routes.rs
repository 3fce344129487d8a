//! API Routes
//!
//! Health, status, node listing, metrics and the live observer socket

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::ws::ws_handler;
use crate::api::Metrics;
use crate::broadcast::UpdateBroadcaster;
use crate::config::PeerFinderConfig;
use crate::liveness::LivenessProbe;
use crate::registry::NodeRegistry;
use crate::scanner::DiscoveredPeers;
use crate::shutdown::Shutdown;

/// Shared API state
pub struct ApiState {
    pub config: Arc<PeerFinderConfig>,
    pub registry: Arc<NodeRegistry>,
    pub broadcaster: Arc<UpdateBroadcaster>,
    pub liveness: Arc<LivenessProbe>,
    pub discovered: Arc<DiscoveredPeers>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_check))
        .route("/status", get(get_status))

        // Nodes
        .route("/nodes", get(get_nodes))
        .route("/nodes/:ip", get(get_node))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        // Live observers
        .route("/ws", get(ws_handler))

        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server until shutdown
pub async fn run_api_server(state: Arc<ApiState>, mut shutdown: Shutdown) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.api_port));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("📊 HTTP API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await?;

    info!("HTTP API server stopped");
    Ok(())
}

fn refresh_gauges(state: &ApiState) {
    state.metrics.set_registry_stats(&state.registry.stats());
    state.metrics.set_known_peers(state.discovered.len() as u64);
}

/// GET /health - Simple health check
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// GET /status - Detailed status
async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = state.registry.stats();

    let status = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "nodes": {
            "total": stats.total_nodes,
            "online": stats.online_nodes,
            "staking": stats.staking_nodes,
        },
        "known_peers": state.discovered.len(),
        "subscribers": state.broadcaster.subscriber_count(),
    });

    Json(status)
}

/// GET /nodes - Every tracked node, most recently discovered first
async fn get_nodes(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let nodes: Vec<_> = state
        .registry
        .get_all()
        .iter()
        .map(|node| node.to_record(false))
        .collect();

    Json(nodes)
}

/// GET /nodes/:ip - One node
async fn get_node(
    State(state): State<Arc<ApiState>>,
    Path(ip): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&ip) {
        Some(node) => Json(node.to_record(false)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Node not found" })),
        )
            .into_response(),
    }
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_gauges(&state);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_gauges(&state);
    Json(state.metrics.to_json())
}
