use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();

    let status = if metrics.errors.delivery == 0 && metrics.errors.publish == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        instance: state.server_config.instance_name.clone(),
        sessions: state.registry.len() as u64,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed relay metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness check - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness check - returns 200 if the store is reachable
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    match state.db.get_stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ready",
            "database": "connected",
            "backend": stats.backend,
            "instances": stats.instances,
            "users": stats.users,
            "connections": stats.connections,
            "chatWindows": stats.chat_windows,
            "messages": stats.messages,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!("Readiness check failed: {:#}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected"
                })),
            )
                .into_response()
        }
    }
}
