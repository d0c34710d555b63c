//! Authentication: bearer tokens resolved to users.
//!
//! A token is resolved, in order, against the demo accounts (when enabled),
//! the cache and store (tokens seen before), and finally the external
//! validation endpoint. The same resolver serves the WebSocket handshake and
//! the HTTP API.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::AppState;
use crate::config::AuthConfig;
use crate::directory::{self, Directory};
use crate::models::User;

// =============================================================================
// Auth Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing auth token")]
    MissingToken,

    #[error("invalid auth token")]
    InvalidToken,

    /// The validation endpoint could not be reached or answered garbage.
    #[error("token validation failed: {0}")]
    ValidatorUnavailable(String),
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingToken => StatusCode::BAD_REQUEST,
            Self::InvalidToken | Self::ValidatorUnavailable(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(serde_json::json!({
                "status": "error",
                "code": "unauthorized",
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

// =============================================================================
// Demo accounts
// =============================================================================

struct DemoAccount {
    token: &'static str,
    user_id: u64,
    user_type: &'static str,
    email: &'static str,
}

const DEMO_ACCOUNTS: &[DemoAccount] = &[
    DemoAccount {
        token: "visitor1",
        user_id: 1,
        user_type: "visitor",
        email: "visitor1@chat.com",
    },
    DemoAccount {
        token: "visitor2",
        user_id: 2,
        user_type: "visitor",
        email: "visitor2@chat.com",
    },
    DemoAccount {
        token: "exhibitor1",
        user_id: 3,
        user_type: "exhibitor",
        email: "exhibitor1@chat.com",
    },
    DemoAccount {
        token: "exhibitor2",
        user_id: 4,
        user_type: "exhibitor",
        email: "exhibitor2@chat.com",
    },
];

fn demo_user(token: &str) -> Option<User> {
    DEMO_ACCOUNTS.iter().find(|a| a.token == token).map(|a| {
        let mut user = User::new(a.user_id, a.token, a.user_type);
        user.email = Some(a.email.to_string());
        user.phone_no = Some("0123456789".to_string());
        user
    })
}

// =============================================================================
// Validator wire format
// =============================================================================

#[derive(Debug, Deserialize)]
struct ValidationResponse {
    #[serde(rename = "statusCode")]
    status_code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<ValidatedUser>,
}

#[derive(Debug, Deserialize)]
struct ValidatedUser {
    #[serde(alias = "Id")]
    id: u64,
    #[serde(alias = "Name")]
    name: String,
    #[serde(rename = "type", alias = "Type")]
    user_type: String,
    #[serde(default)]
    profile_picture: Option<String>,
    #[serde(default, alias = "Email")]
    email: Option<String>,
    #[serde(default, rename = "phoneNo", alias = "PhoneNo")]
    phone_no: Option<String>,
}

// =============================================================================
// Resolver
// =============================================================================

/// A resolved token. `is_new` is set when the store has never seen the user.
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub user: User,
    pub is_new: bool,
}

pub struct TokenResolver {
    directory: Arc<Directory>,
    client: reqwest::Client,
    config: AuthConfig,
}

impl TokenResolver {
    pub fn new(directory: Arc<Directory>, config: AuthConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            directory,
            client,
            config,
        })
    }

    pub async fn resolve(&self, token: &str) -> Result<ResolvedUser, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if directory::is_reserved_key(token) {
            debug!("Refusing token shaped like a cache key");
            return Err(AuthError::InvalidToken);
        }

        if self.config.demo_users {
            if let Some(demo) = demo_user(token) {
                return Ok(self.merge_with_stored(demo, token).await);
            }
        }

        match self.directory.user_by_token(token).await {
            Ok(Some(mut user)) => {
                user.last_auth_token = Some(token.to_string());
                return Ok(ResolvedUser {
                    user,
                    is_new: false,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Token lookup failed, asking validator: {:#}", e),
        }

        let validated = self.validate_remotely(token).await?;
        let mut user = User::new(validated.id, validated.name, validated.user_type);
        user.email = validated.email.filter(|s| !s.is_empty());
        user.phone_no = validated.phone_no.filter(|s| !s.is_empty());
        user.profile_picture = validated.profile_picture.filter(|s| !s.is_empty());
        Ok(self.merge_with_stored(user, token).await)
    }

    async fn validate_remotely(&self, token: &str) -> Result<ValidatedUser, AuthError> {
        let Some(endpoint) = self.config.validation_endpoint.as_deref() else {
            debug!("No validation endpoint configured; rejecting unknown token");
            return Err(AuthError::InvalidToken);
        };

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::ValidatorUnavailable(e.to_string()))?;
        let body: ValidationResponse = response
            .json()
            .await
            .map_err(|e| AuthError::ValidatorUnavailable(e.to_string()))?;

        if body.status_code != self.config.success_status_code {
            debug!(
                "Validator refused token: {} {}",
                body.status_code,
                body.message.as_deref().unwrap_or("")
            );
            return Err(AuthError::InvalidToken);
        }
        body.data.ok_or(AuthError::InvalidToken)
    }

    /// Carry over the stored row id and live sessions for a known user.
    async fn merge_with_stored(&self, mut user: User, token: &str) -> ResolvedUser {
        user.last_auth_token = Some(token.to_string());
        let stored = match self.directory.user_by_user_id(user.user_id, false).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to load user {}: {:#}", user.user_id, e);
                None
            }
        };
        match stored {
            Some(stored) => {
                user.id = stored.id;
                user.created_at = stored.created_at;
                user.connections = stored.connections;
                ResolvedUser {
                    user,
                    is_new: false,
                }
            }
            None => ResolvedUser { user, is_new: true },
        }
    }
}

// =============================================================================
// Token extraction
// =============================================================================

/// Token from an `Authorization` header, with or without the `Bearer ` prefix.
pub fn token_from_header(value: &str) -> &str {
    let value = value.trim();
    value.strip_prefix("Bearer ").unwrap_or(value).trim()
}

/// Token from the `authToken` parameter of a query string.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    let url = reqwest::Url::parse(&format!("ws://relay/?{query}")).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "authToken")
        .map(|(_, v)| v.into_owned())
}

// =============================================================================
// Axum Extractor
// =============================================================================

/// The authenticated caller of an HTTP API route.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| token_from_header(v).to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| token_from_query(parts.uri.query()))
            .ok_or(AuthError::MissingToken)?;

        let resolved = state.resolver.resolve(&token).await?;
        let mut user = resolved.user;

        // API callers may never have opened a socket; make sure they exist in the store
        let repository = state.directory.repository();
        let persisted = if resolved.is_new {
            repository.insert_user(&user).await.map(|id| user.id = id)
        } else {
            repository.update_user(&user).await.map(|_| ())
        };
        if let Err(e) = persisted {
            warn!("Failed to persist API user {}: {:#}", user.user_id, e);
        }
        state.directory.cache_token(&token, user.user_id).await;

        Ok(AuthUser(user))
    }
}
