use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use super::ApiResponse;
use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ChatError;
use crate::models::{ChatMessage, ChatWindow, PublicChatWindow, User};
use crate::router::FanOutReport;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChatRequest {
    pub to_user: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChatResponse {
    pub chat_window_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    /// The caller's live session the message is sent from; it is not echoed.
    pub connection_id: String,
    pub message: String,
}

/// Load a window from the store and check the caller takes part in it.
async fn window_for(state: &AppState, uid: &str, user: &User) -> Result<ChatWindow, ChatError> {
    let window = state
        .repository
        .get_chat_window_by_uid(uid)
        .await
        .map_err(ChatError::Persistence)?
        .ok_or_else(|| ChatError::NotFound(format!("chat window {uid}")))?;

    if !window.has_participant(user.user_id) {
        return Err(ChatError::PermissionDenied(format!(
            "user {} is not a participant of chat window {}",
            user.user_id, uid
        )));
    }
    Ok(window)
}

/// The caller's chat windows, most recent activity first.
pub async fn list_chat_windows(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<ApiResponse<Vec<PublicChatWindow>>>, ChatError> {
    let windows = state
        .repository
        .list_chat_windows_by_participant(user.user_id)
        .await
        .map_err(ChatError::Persistence)?;
    Ok(Json(ApiResponse::success(
        windows.iter().map(PublicChatWindow::from).collect(),
    )))
}

pub async fn init_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<InitChatRequest>,
) -> Result<Json<ApiResponse<InitChatResponse>>, ChatError> {
    let chat_window_id = state.router.initiate(&user, req.to_user).await?;
    Ok(Json(ApiResponse::success(InitChatResponse { chat_window_id })))
}

pub async fn get_chat_window(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(uid): Path<String>,
) -> Result<Json<ApiResponse<PublicChatWindow>>, ChatError> {
    let window = window_for(&state, &uid, &user).await?;
    Ok(Json(ApiResponse::success(PublicChatWindow::from(&window))))
}

pub async fn post_chat_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(uid): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<ApiResponse<FanOutReport>>, ChatError> {
    if req.message.is_empty() {
        return Err(ChatError::InvalidRequest("message is empty".to_string()));
    }

    // Only the caller's own sessions may be used as the origin
    let owner = state
        .directory
        .user_by_session(&req.connection_id, false)
        .await
        .map_err(ChatError::Persistence)?
        .ok_or_else(|| ChatError::NotFound(format!("session {}", req.connection_id)))?;
    if owner.user_id != user.user_id {
        return Err(ChatError::PermissionDenied(format!(
            "session {} belongs to another user",
            req.connection_id
        )));
    }

    let report = state
        .router
        .send(&req.connection_id, &uid, &req.message)
        .await?;
    Ok(Json(ApiResponse::success(report)))
}

/// Message history, oldest first. Reading as the recipient of the last
/// message marks it seen.
pub async fn list_chat_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(uid): Path<String>,
) -> Result<Json<ApiResponse<Vec<ChatMessage>>>, ChatError> {
    let window = window_for(&state, &uid, &user).await?;

    let messages = state
        .repository
        .list_chat_messages(&uid)
        .await
        .map_err(ChatError::Persistence)?;

    if window.last_message_at.is_some()
        && window.last_message_sender_user_id != user.user_id
        && !window.last_message_seen_by_recipient
    {
        state
            .repository
            .mark_last_message_seen(&uid)
            .await
            .map_err(ChatError::Persistence)?;
        // Refresh the cached copy so later sends see the flag
        if let Err(e) = state.directory.chat_window(&uid, true).await {
            tracing::warn!("Failed to refresh chat window {}: {:#}", uid, e);
        }
    }

    Ok(Json(ApiResponse::success(messages)))
}
