use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_protocol::ProtocolError;

/// Failures of chat operations, shared by the socket protocol and the HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A critical write failed; nothing was delivered.
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ChatError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Persistence(_) => "persistence_failure",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<ProtocolError> for ChatError {
    fn from(err: ProtocolError) -> Self {
        if err.is_policy_violation() {
            Self::PermissionDenied(err.to_string())
        } else {
            Self::InvalidRequest(err.to_string())
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(serde_json::json!({
                "status": "error",
                "code": self.error_code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
