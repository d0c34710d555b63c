//! Client frame handling.
//!
//! Protocol errors never reach the peer: they are logged and the frame is
//! dropped, leaving the session open.

use std::sync::Arc;

use relay_protocol::{Command, InboundFrame, KEEPALIVE_FRAME};
use tracing::{debug, warn};

use super::registry::SessionRegistry;
use super::session::Session;
use crate::directory::Directory;
use crate::error::ChatError;
use crate::metrics::RelayMetrics;
use crate::router::MessageRouter;

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    directory: Arc<Directory>,
    router: Arc<MessageRouter>,
    metrics: Arc<RelayMetrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        directory: Arc<Directory>,
        router: Arc<MessageRouter>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            directory,
            router,
            metrics,
        }
    }

    /// Frames of one read batch, in arrival order.
    pub async fn handle_batch(&self, session: &Session, frames: Vec<String>) {
        for frame in frames {
            self.handle(session, &frame).await;
        }
    }

    pub async fn handle(&self, session: &Session, text: &str) {
        if text == KEEPALIVE_FRAME {
            return;
        }
        self.metrics.frame_received();

        let command = match InboundFrame::parse(text).and_then(InboundFrame::into_command) {
            Ok(command) => command,
            Err(e) => {
                self.metrics.frame_malformed();
                warn!("Session {}: dropping frame: {}", session.id(), e);
                return;
            }
        };

        if let Err(e) = self.execute(session, command).await {
            warn!("Session {}: {} ({})", session.id(), e, e.error_code());
        }
    }

    async fn execute(&self, session: &Session, command: Command) -> Result<(), ChatError> {
        match command {
            Command::Init { to_user } => {
                let user = self
                    .directory
                    .user_by_session(session.id(), true)
                    .await
                    .map_err(ChatError::Persistence)?
                    .ok_or_else(|| ChatError::NotFound(format!("owner of session {}", session.id())))?;
                self.router.initiate(&user, to_user).await?;
            }
            Command::Send {
                chat_window_id,
                message,
            } => {
                self.router
                    .send(session.id(), &chat_window_id, &message)
                    .await?;
            }
            Command::Disconnect => {
                debug!("Session {} asked to disconnect", session.id());
                self.registry.remove_session(session.id()).await;
            }
            Command::Ignore => debug!("Session {}: ignoring unknown action", session.id()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers::seed_user;
    use crate::test_helpers::{TestNode, assert_no_text, read_text, test_node};
    use relay_protocol::{Event, OutgoingEnvelope};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn dispatcher(node: &TestNode) -> Dispatcher {
        Dispatcher::new(
            node.registry.clone(),
            node.directory.clone(),
            node.router.clone(),
            node.metrics.clone(),
        )
    }

    #[tokio::test]
    async fn test_init_then_send() {
        let node = test_node().await;
        let dispatch = dispatcher(&node);
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node.repository, 3, "Bob", "exhibitor").await;
        let (a, mut ada_client) = node.connect(&ada).await;
        let (_b, mut bob_client) = node.connect(&bob).await;

        dispatch.handle(&a, r#"{"action":"init","toUser":3}"#).await;
        let init = OutgoingEnvelope::decode(&read_text(&mut ada_client)).unwrap();
        assert_eq!(init.event, Event::InitChat);
        let uid = init.chat_window_id.unwrap();
        read_text(&mut bob_client);

        let frame = serde_json::json!({"action": "send", "chatWindowId": uid, "message": "hi"});
        dispatch.handle(&a, &frame.to_string()).await;
        let msg = OutgoingEnvelope::decode(&read_text(&mut bob_client)).unwrap();
        assert_eq!(msg.event, Event::NewMessage);
        assert_eq!(msg.payload["message"], "hi");
        assert_no_text(&mut ada_client, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_bad_frames_are_dropped_and_session_survives() {
        let node = test_node().await;
        let dispatch = dispatcher(&node);
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let (a, mut client) = node.connect(&ada).await;

        dispatch
            .handle_batch(
                &a,
                vec![
                    "p".to_string(),
                    "{not json".to_string(),
                    r#"{"action":"send","message":"no window"}"#.to_string(),
                    r#"{"action":"dance"}"#.to_string(),
                    r#"{"action":"init","toUser":77}"#.to_string(),
                ],
            )
            .await;

        assert!(node.registry.contains(a.id()));
        assert_no_text(&mut client, Duration::from_millis(100));
        // The keepalive echo is not counted as a frame
        assert_eq!(node.metrics.frames_received.load(Ordering::Relaxed), 4);
        assert_eq!(node.metrics.frames_malformed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let node = test_node().await;
        let dispatch = dispatcher(&node);
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let (a, _client) = node.connect(&ada).await;

        dispatch.handle(&a, r#"{"action":"disconnect"}"#).await;

        assert!(!node.registry.contains(a.id()));
        assert!(node.repository.get_connection(a.id()).await.unwrap().is_none());
    }
}
