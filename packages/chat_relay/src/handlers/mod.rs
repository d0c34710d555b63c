pub mod chat;
pub mod health;
pub mod users;

use axum::{
    Router,
    routing::{get, post},
};
use serde::Serialize;

use crate::AppState;

// Re-export all handlers for easy route registration
pub use chat::{get_chat_window, init_chat, list_chat_messages, list_chat_windows, post_chat_message};
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use users::{get_myself, list_users};

/// Envelope for every API response body.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success",
            code: None,
            message: None,
            data: Some(data),
        }
    }
}

/// The `/api/v1` routes. Health and metrics are mounted separately.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/users", get(list_users))
        .route("/api/v1/users/myself", get(get_myself))
        .route("/api/v1/chat/windows", get(list_chat_windows))
        .route("/api/v1/chat/init", post(init_chat))
        .route("/api/v1/chat/{id}", get(get_chat_window))
        .route(
            "/api/v1/chat/{id}/messages",
            get(list_chat_messages).post(post_chat_message),
        )
}
