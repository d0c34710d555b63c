//! Cache-aside lookups of users, session owners and chat windows.
//!
//! Reads try the cache first unless the caller asks for a fresh copy, then
//! fall back to the store and repopulate the cache. Cache failures never fail
//! a lookup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::CacheConfig;
use crate::models::{ChatWindow, User};
use crate::repository::ChatRepository;

const SESSION_PREFIX: &str = "conu-";
const USER_PREFIX: &str = "usr-";
const WINDOW_PREFIX: &str = "cw-";

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

pub fn user_key(user_id: u64) -> String {
    format!("{USER_PREFIX}{user_id}")
}

pub fn window_key(uid: &str) -> String {
    format!("{WINDOW_PREFIX}{uid}")
}

/// Auth tokens are cached under the bare token.
pub fn token_key(token: &str) -> String {
    token.to_string()
}

/// Tokens that would land on another record's cache key.
pub fn is_reserved_key(token: &str) -> bool {
    [SESSION_PREFIX, USER_PREFIX, WINDOW_PREFIX]
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

pub struct Directory {
    repository: Arc<ChatRepository>,
    cache: Arc<Cache>,
    user_ttl: Duration,
    window_ttl: Duration,
}

impl Directory {
    pub fn new(repository: Arc<ChatRepository>, cache: Arc<Cache>, config: &CacheConfig) -> Self {
        Self {
            repository,
            cache,
            user_ttl: config.user_ttl,
            window_ttl: config.window_ttl,
        }
    }

    pub fn repository(&self) -> &Arc<ChatRepository> {
        &self.repository
    }

    pub async fn user_by_user_id(&self, user_id: u64, ignore_cache: bool) -> Result<Option<User>> {
        if !ignore_cache {
            if let Some(user) = self.cached_json::<User>(&user_key(user_id)).await {
                return Ok(Some(user));
            }
        }

        let user = self.repository.get_user_by_user_id(user_id).await?;
        if let Some(user) = &user {
            self.cache_user(user).await;
        }
        Ok(user)
    }

    pub async fn user_by_session(&self, session_id: &str, ignore_cache: bool) -> Result<Option<User>> {
        if !ignore_cache {
            if let Some(user_id) = self.cached_user_id(&session_key(session_id)).await {
                if let Some(user) = self.user_by_user_id(user_id, false).await? {
                    return Ok(Some(user));
                }
            }
        }

        let user = self.repository.get_user_by_session(session_id).await?;
        if let Some(user) = &user {
            self.cache_session(session_id, user.user_id).await;
            self.cache_user(user).await;
        }
        Ok(user)
    }

    pub async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        if let Some(user_id) = self.cached_user_id(&token_key(token)).await {
            if let Some(user) = self.user_by_user_id(user_id, false).await? {
                return Ok(Some(user));
            }
        }

        let user = self.repository.get_user_by_auth_token(token).await?;
        if let Some(user) = &user {
            self.cache_token(token, user.user_id).await;
            self.cache_user(user).await;
        }
        Ok(user)
    }

    /// A cached copy without both participants is treated as a miss.
    pub async fn chat_window(&self, uid: &str, ignore_cache: bool) -> Result<Option<ChatWindow>> {
        if !ignore_cache {
            if let Some(window) = self.cached_json::<ChatWindow>(&window_key(uid)).await {
                if window.participants.len() == 2 {
                    return Ok(Some(window));
                }
                debug!("Cached chat window {} is incomplete, reading store", uid);
            }
        }

        let window = self.repository.get_chat_window_by_uid(uid).await?;
        if let Some(window) = &window {
            self.cache_window(window).await;
        }
        Ok(window)
    }

    pub async fn cache_user(&self, user: &User) {
        self.save_json(&user_key(user.user_id), user, self.user_ttl)
            .await;
    }

    pub async fn cache_window(&self, window: &ChatWindow) {
        self.save_json(&window_key(&window.uid), window, self.window_ttl)
            .await;
    }

    pub async fn cache_session(&self, session_id: &str, user_id: u64) {
        self.save_raw(&session_key(session_id), &user_id.to_string(), self.user_ttl)
            .await;
    }

    pub async fn cache_token(&self, token: &str, user_id: u64) {
        self.save_raw(&token_key(token), &user_id.to_string(), self.user_ttl)
            .await;
    }

    pub async fn forget_session(&self, session_id: &str) {
        if let Err(e) = self.cache.delete(&session_key(session_id)).await {
            warn!("Failed to evict session {} from cache: {}", session_id, e);
        }
    }

    async fn cached_user_id(&self, key: &str) -> Option<u64> {
        self.cached_raw(key).await?.parse().ok()
    }

    async fn cached_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.cached_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Dropping undecodable cache entry {}: {}", key, e);
                let _ = self.cache.delete(key).await;
                None
            }
        }
    }

    async fn cached_raw(&self, key: &str) -> Option<String> {
        match self.cache.fetch(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Cache read for {} failed: {}", key, e);
                None
            }
        }
    }

    async fn save_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.save_raw(key, &raw, ttl).await,
            Err(e) => warn!("Failed to encode cache entry {}: {}", key, e),
        }
    }

    async fn save_raw(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.cache.save(key, value, ttl).await {
            warn!("Cache write for {} failed: {}", key, e);
        }
    }
}
