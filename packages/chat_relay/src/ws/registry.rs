//! Live sessions owned by this process.
//!
//! The table is the only authority on which sessions this instance may write
//! to. Durable state (connection rows, the user's session set, cache entries)
//! follows it on a best-effort basis: failures there are logged and the session
//! lifecycle carries on.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use relay_protocol::OutgoingEnvelope;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use super::multiplexer::Multiplexer;
use super::session::Session;
use crate::directory::Directory;
use crate::metrics::RelayMetrics;
use crate::models::{Connection, User};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    multiplexer: Arc<Multiplexer>,
    directory: Arc<Directory>,
    metrics: Arc<RelayMetrics>,
    instance_id: String,
}

impl SessionRegistry {
    pub fn new(
        multiplexer: Arc<Multiplexer>,
        directory: Arc<Directory>,
        metrics: Arc<RelayMetrics>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            multiplexer,
            directory,
            metrics,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    /// Admit an authenticated session and greet it with `WELCOME`.
    pub async fn add_session(
        &self,
        user: &User,
        session: Arc<Session>,
        is_new_user: bool,
        auth_token: &str,
    ) {
        let session_id = session.id().to_string();
        self.write_table().insert(session_id.clone(), session.clone());
        self.metrics.session_opened();

        let repository = self.directory.repository();

        let mut user = user.clone();
        user.last_auth_token = Some(auth_token.to_string());
        let persisted = if is_new_user {
            repository.insert_user(&user).await.map(|_| ())
        } else {
            match repository.update_user(&user).await {
                Ok(true) => Ok(()),
                // Cached but never stored (or the row was purged)
                Ok(false) => repository.insert_user(&user).await.map(|_| ()),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = persisted {
            warn!("Failed to persist user {}: {:#}", user.user_id, e);
        }

        let connection = Connection {
            session_id: session_id.clone(),
            user_id: user.user_id,
            instance_id: self.instance_id().to_string(),
            created_at: Utc::now().timestamp(),
        };
        if let Err(e) = repository.insert_connection(&connection).await {
            warn!("Failed to record connection {}: {:#}", session_id, e);
        }

        // Re-read so the cached set includes sessions held by other instances
        match self.directory.user_by_user_id(user.user_id, true).await {
            Ok(Some(stored)) => user = stored,
            Ok(None) => {
                user.attach(&session_id);
            }
            Err(e) => {
                warn!("Failed to reload user {}: {:#}", user.user_id, e);
                user.attach(&session_id);
            }
        }
        self.directory.cache_user(&user).await;
        self.directory.cache_session(&session_id, user.user_id).await;
        self.directory.cache_token(auth_token, user.user_id).await;

        info!(
            "Session {} opened for user {} ({} live on {})",
            session_id,
            user.user_id,
            self.len(),
            self.instance_id()
        );

        let welcome = OutgoingEnvelope::welcome(user.user_id, &session_id);
        match welcome.to_json() {
            Ok(text) => {
                if let Err(e) = self.send(&session, &text).await {
                    warn!("Failed to send WELCOME to {}: {}", session_id, e);
                    self.metrics.delivery_failed();
                }
            }
            Err(e) => warn!("Failed to encode WELCOME for {}: {}", session_id, e),
        }
    }

    /// Tear a session down. Unknown ids are ignored, so this is safe to call
    /// from every eviction path.
    pub async fn remove_session(&self, session_id: &str) {
        let Some(session) = self.write_table().remove(session_id) else {
            debug!("Session {} already removed", session_id);
            return;
        };
        self.metrics.session_closed();

        self.multiplexer.unregister(&session);
        session.close();

        let repository = self.directory.repository();
        if let Err(e) = repository.delete_connection(session_id).await {
            warn!("Failed to delete connection {}: {:#}", session_id, e);
        }
        self.directory.forget_session(session_id).await;

        let user_id = session.user_id();
        match repository.get_user_by_user_id(user_id).await {
            Ok(Some(mut user)) => {
                user.detach(session_id);
                if let Err(e) = repository.update_user(&user).await {
                    warn!("Failed to persist user {}: {:#}", user_id, e);
                }
                self.directory.cache_user(&user).await;
            }
            Ok(None) => debug!("Session {} had no stored owner {}", session_id, user_id),
            Err(e) => warn!("Failed to load user {}: {:#}", user_id, e),
        }

        info!(
            "Session {} closed for user {} ({} live on {})",
            session_id,
            user_id,
            self.len(),
            self.instance_id()
        );
    }

    /// Write one text frame on the blocking pool, so a peer that stops
    /// reading holds up this call only. The transport error is returned unmodified.
    pub async fn send(&self, session: &Arc<Session>, text: &str) -> Result<(), tungstenite::Error> {
        let session = session.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || session.send_text(&text))
            .await
            .unwrap_or_else(|e| Err(tungstenite::Error::Io(io::Error::other(e))))
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.read_table().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read_table().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.read_table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.read_table().values().cloned().collect()
    }

    fn read_table(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
