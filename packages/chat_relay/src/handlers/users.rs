use axum::{Json, extract::State};

use super::ApiResponse;
use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ChatError;
use crate::models::{PublicUser, User};

/// Everyone the caller may open a chat window with.
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<ApiResponse<Vec<PublicUser>>>, ChatError> {
    if state.router.policy().is_restricted(&user.user_type) {
        return Err(ChatError::PermissionDenied(format!(
            "{} users cannot start chats",
            user.user_type
        )));
    }

    let partners = state
        .repository
        .list_chat_partners(user.user_id, &user.user_type)
        .await
        .map_err(ChatError::Persistence)?;
    Ok(Json(ApiResponse::success(
        partners.iter().map(PublicUser::from).collect(),
    )))
}

pub async fn get_myself(AuthUser(user): AuthUser) -> Json<ApiResponse<User>> {
    Json(ApiResponse::success(user))
}
