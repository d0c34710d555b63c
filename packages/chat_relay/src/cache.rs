//! Shared key/value cache with per-entry TTL.
//!
//! The `memory` backend keeps entries in this process only; `redis` shares
//! them across every relay instance. Callers treat the cache as advisory and
//! fall back to the store on a miss or an error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{CacheBackendKind, CacheConfig};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis cache error: {0}")]
    Redis(#[from] redis::RedisError),
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    async fn fetch(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.value.clone())
    }

    async fn save(&self, key: &str, value: &str, ttl: Duration) {
        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }
}

pub struct RedisCache {
    conn: MultiplexedConnection,
}

pub enum Cache {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl Cache {
    pub fn memory() -> Self {
        Self::Memory(MemoryCache::default())
    }

    pub async fn connect(config: &CacheConfig) -> anyhow::Result<Self> {
        match config.backend {
            CacheBackendKind::Memory => {
                info!("Cache backend: in-process memory");
                Ok(Self::memory())
            }
            CacheBackendKind::Redis => {
                let client = redis::Client::open(config.redis_url.as_str())
                    .with_context(|| format!("Invalid redis URL: {}", config.redis_url))?;
                let conn = client
                    .get_multiplexed_async_connection()
                    .await
                    .with_context(|| format!("Failed to connect to redis at {}", config.redis_url))?;
                info!("Cache backend: redis at {}", config.redis_url);
                Ok(Self::Redis(RedisCache { conn }))
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }

    /// `Ok(None)` on a miss or an expired entry.
    pub async fn fetch(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self {
            Self::Memory(cache) => Ok(cache.fetch(key).await),
            Self::Redis(cache) => {
                let mut conn = cache.conn.clone();
                let value: Option<String> = conn.get(key).await?;
                Ok(value)
            }
        }
    }

    pub async fn save(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            Self::Memory(cache) => {
                cache.save(key, value, ttl).await;
                Ok(())
            }
            Self::Redis(cache) => {
                let mut conn = cache.conn.clone();
                // Redis rejects a zero expiry
                let secs = ttl.as_secs().max(1);
                let _: () = conn.set_ex(key, value, secs).await?;
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            Self::Memory(cache) => {
                cache.delete(key).await;
                Ok(())
            }
            Self::Redis(cache) => {
                let mut conn = cache.conn.clone();
                let _: () = conn.del(key).await?;
                Ok(())
            }
        }
    }

    /// Drop expired entries. Redis expires keys itself, so this is a no-op there.
    pub async fn purge_expired(&self) -> usize {
        match self {
            Self::Memory(cache) => cache.purge_expired().await,
            Self::Redis(_) => 0,
        }
    }
}
