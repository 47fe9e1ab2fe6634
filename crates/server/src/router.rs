use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chainmux_core::upstream::{EndpointStatus, Multiplexer};
use std::sync::Arc;

/// Read-only routes over the registry.
pub fn create_router(registry: Arc<Multiplexer>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .with_state(registry)
}

/// Snapshot of every endpoint, sorted by name.
pub async fn handle_status(State(registry): State<Arc<Multiplexer>>) -> Json<Vec<EndpointStatus>> {
    Json(registry.status())
}

/// Reports 200 while every chain has at least one healthy endpoint, 503 otherwise.
pub async fn handle_health(State(registry): State<Arc<Multiplexer>>) -> impl IntoResponse {
    let status = registry.status();
    let healthy = status.iter().filter(|s| s.healthy).count();
    let degraded: Vec<String> = registry
        .chains()
        .into_iter()
        .filter(|chain| registry.select(chain, "").is_none())
        .map(|chain| chain.to_string())
        .collect();

    let body = serde_json::json!({
        "status": if degraded.is_empty() { "healthy" } else { "degraded" },
        "endpoints": {
            "total": status.len(),
            "healthy": healthy,
        },
        "degraded_chains": degraded,
        "syncing": registry.is_syncing().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    let code = if degraded.is_empty() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}
