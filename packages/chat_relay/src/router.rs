//! Chat window creation and message fan-out.
//!
//! Every envelope goes to each target session exactly once: directly when this
//! instance owns the session, through the bus otherwise.

use std::sync::Arc;

use chrono::Utc;
use relay_protocol::{ChatPolicy, OutgoingEnvelope};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::directory::Directory;
use crate::error::ChatError;
use crate::metrics::RelayMetrics;
use crate::models::{ChatMessage, ChatWindow, User};
use crate::ws::SessionRegistry;

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    /// Written to a session owned by this instance.
    pub delivered: usize,
    /// Published for a session owned elsewhere.
    pub published: usize,
    pub failed: usize,
}

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    directory: Arc<Directory>,
    bus: Arc<Bus>,
    policy: ChatPolicy,
    metrics: Arc<RelayMetrics>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        directory: Arc<Directory>,
        bus: Arc<Bus>,
        policy: ChatPolicy,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            directory,
            bus,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &ChatPolicy {
        &self.policy
    }

    /// Open (or reopen) the window between `from` and `to_user_id` and
    /// announce it to every session of both users. Returns the window uid.
    pub async fn initiate(&self, from: &User, to_user_id: u64) -> Result<String, ChatError> {
        let repository = self.directory.repository();

        let to = repository
            .get_user_by_user_id(to_user_id)
            .await
            .map_err(ChatError::Persistence)?
            .ok_or_else(|| ChatError::NotFound(format!("user {to_user_id}")))?;

        self.policy.check_pair(&from.user_type, &to.user_type)?;

        let existing = repository
            .get_chat_window_by_participants(from.user_id, to.user_id)
            .await
            .map_err(ChatError::Persistence)?;

        let window = match existing {
            Some(window) => window,
            None => {
                self.policy.check_initiator(&from.user_type)?;
                self.create_window(from, &to).await?
            }
        };

        self.directory.cache_window(&window).await;

        let envelope = OutgoingEnvelope::init_chat(
            &window.uid,
            from.user_id,
            &window.public_participants(),
        )?;
        let mut targets = Vec::new();
        for participant in &window.participants {
            targets.extend(self.session_ids(participant.user_id, true).await);
        }
        let report = self.fan_out(&envelope, &targets).await?;

        info!(
            "Chat window {} ready for {} and {} ({} local, {} remote)",
            window.uid, from.user_id, to.user_id, report.delivered, report.published
        );
        Ok(window.uid)
    }

    /// Store a message from `from_session_id` and relay it to every other
    /// session of both participants.
    pub async fn send(
        &self,
        from_session_id: &str,
        chat_window_uid: &str,
        text: &str,
    ) -> Result<FanOutReport, ChatError> {
        let mut window = self
            .directory
            .chat_window(chat_window_uid, false)
            .await
            .map_err(ChatError::Persistence)?
            .ok_or_else(|| ChatError::NotFound(format!("chat window {chat_window_uid}")))?;

        let sender = self
            .directory
            .user_by_session(from_session_id, false)
            .await
            .map_err(ChatError::Persistence)?
            .ok_or_else(|| ChatError::NotFound(format!("session {from_session_id}")))?;

        if !window.has_participant(sender.user_id) {
            return Err(ChatError::PermissionDenied(format!(
                "user {} is not a participant of chat window {}",
                sender.user_id, chat_window_uid
            )));
        }

        let repository = self.directory.repository();
        let message = ChatMessage::text(chat_window_uid, sender.user_id, text);
        repository
            .insert_chat_message(&message)
            .await
            .map_err(ChatError::Persistence)?;

        window.record_message(&sender, text, Utc::now().timestamp());
        if let Err(e) = repository.update_chat_window_last_message_info(&window).await {
            warn!(
                "Failed to update last message of chat window {}: {:#}",
                chat_window_uid, e
            );
        }
        self.directory.cache_window(&window).await;

        let envelope = OutgoingEnvelope::new_message(chat_window_uid, sender.user_id, text);
        let mut targets = Vec::new();
        for participant in &window.participants {
            targets.extend(
                self.session_ids(participant.user_id, false)
                    .await
                    .into_iter()
                    .filter(|id| id != from_session_id),
            );
        }

        let report = self.fan_out(&envelope, &targets).await?;
        debug!(
            "Message in {} from {}: {} local, {} remote, {} failed",
            chat_window_uid, sender.user_id, report.delivered, report.published, report.failed
        );
        Ok(report)
    }

    /// Local targets are written directly; the rest get a bus copy carrying
    /// `toConnection`. Delivery failures are counted, never returned.
    async fn fan_out(
        &self,
        envelope: &OutgoingEnvelope,
        targets: &[String],
    ) -> Result<FanOutReport, ChatError> {
        let text = envelope.to_json()?;
        let mut report = FanOutReport::default();

        for target in targets {
            if let Some(session) = self.registry.get(target) {
                match self.registry.send(&session, &text).await {
                    Ok(()) => {
                        report.delivered += 1;
                        self.metrics.delivered_locally();
                    }
                    Err(e) => {
                        report.failed += 1;
                        self.metrics.delivery_failed();
                        warn!("Failed to write to session {}: {}", target, e);
                    }
                }
                continue;
            }

            match self.bus.publish(&envelope.addressed_to(target)).await {
                Ok(_) => {
                    report.published += 1;
                    self.metrics.published_remotely();
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.publish_failed();
                    warn!("Failed to publish for session {}: {}", target, e);
                }
            }
        }

        Ok(report)
    }

    async fn create_window(&self, from: &User, to: &User) -> Result<ChatWindow, ChatError> {
        let repository = self.directory.repository();
        let window = ChatWindow::new(from, to);

        match repository.insert_chat_window(&window).await {
            Ok(_) => {
                // Re-read for row ids and live session sets
                Ok(repository
                    .get_chat_window_by_uid(&window.uid)
                    .await
                    .map_err(ChatError::Persistence)?
                    .unwrap_or(window))
            }
            Err(e) => {
                // A concurrent initiate for the same pair won the insert
                match repository
                    .get_chat_window_by_participants(from.user_id, to.user_id)
                    .await
                {
                    Ok(Some(existing)) => {
                        debug!("Chat window for {} already created", existing.participants_key);
                        Ok(existing)
                    }
                    _ => Err(ChatError::Persistence(e)),
                }
            }
        }
    }

    /// Session ids of a user across every instance. Lookup failures yield none.
    async fn session_ids(&self, user_id: u64, ignore_cache: bool) -> Vec<String> {
        match self.directory.user_by_user_id(user_id, ignore_cache).await {
            Ok(Some(user)) => user.connections,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to load sessions of user {}: {:#}", user_id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::run_subscriber;
    use crate::repository::test_helpers::seed_user;
    use crate::test_helpers::{TestNode, assert_no_text, read_text, test_fleet, test_node};
    use futures::StreamExt;
    use relay_protocol::{Event, MessagePayload};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_initiate_creates_one_window_per_pair() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        seed_user(&node.repository, 3, "Bob", "exhibitor").await;

        let first = node.router.initiate(&ada, 3).await.unwrap();
        let second = node.router.initiate(&ada, 3).await.unwrap();
        assert_eq!(first, second);

        let windows = node.repository.list_chat_windows_by_participant(1).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].participants_key, "1&3");
        assert!(node.cache.fetch(&format!("cw-{first}")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restricted_user_may_reopen_but_not_open() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node.repository, 3, "Bob", "exhibitor").await;

        let err = node.router.initiate(&bob, 1).await.unwrap_err();
        assert_eq!(err.error_code(), "permission_denied");

        let uid = node.router.initiate(&ada, 3).await.unwrap();
        assert_eq!(node.router.initiate(&bob, 1).await.unwrap(), uid);
    }

    #[tokio::test]
    async fn test_initiate_rejects_same_type_and_unknown_user() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        seed_user(&node.repository, 2, "Cy", "visitor").await;

        let err = node.router.initiate(&ada, 2).await.unwrap_err();
        assert_eq!(err.error_code(), "permission_denied");
        assert!(node.repository.get_chat_window_by_participants(1, 2).await.unwrap().is_none());

        let err = node.router.initiate(&ada, 99).await.unwrap_err();
        assert_eq!(err.error_code(), "not_found");
    }

    #[tokio::test]
    async fn test_initiate_announces_to_both_users() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node.repository, 3, "Bob", "exhibitor").await;
        let (_a, mut ada_client) = node.connect(&ada).await;
        let (_b, mut bob_client) = node.connect(&bob).await;

        let uid = node.router.initiate(&ada, 3).await.unwrap();

        for client in [&mut ada_client, &mut bob_client] {
            let envelope = OutgoingEnvelope::decode(&read_text(client)).unwrap();
            assert_eq!(envelope.event, Event::InitChat);
            assert_eq!(envelope.chat_window_id.as_deref(), Some(uid.as_str()));
            assert_eq!(envelope.from, 1);
            assert_eq!(envelope.payload["participants"].as_array().unwrap().len(), 2);
            assert!(envelope.to_connection.is_none());
        }
    }

    #[tokio::test]
    async fn test_send_reaches_other_devices_without_echo() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node.repository, 3, "Bob", "exhibitor").await;
        let uid = node.router.initiate(&ada, 3).await.unwrap();

        let (phone, mut phone_client) = node.connect(&ada).await;
        let (_laptop, mut laptop_client) = node.connect(&ada).await;
        let (_b, mut bob_client) = node.connect(&bob).await;

        let report = node.router.send(phone.id(), &uid, "hello").await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.published, 0);

        for client in [&mut laptop_client, &mut bob_client] {
            let envelope = OutgoingEnvelope::decode(&read_text(client)).unwrap();
            assert_eq!(envelope.event, Event::NewMessage);
            assert_eq!(envelope.from, 1);
            let payload: MessagePayload = envelope.payload_as().unwrap();
            assert_eq!(payload.kind, "txt");
            assert_eq!(payload.message, "hello");
        }
        assert_no_text(&mut phone_client, Duration::from_millis(100));

        let history = node.repository.list_chat_messages(&uid).await.unwrap();
        assert_eq!(history.len(), 1);
        let window = node.repository.get_chat_window_by_uid(&uid).await.unwrap().unwrap();
        assert_eq!(window.last_message, "hello");
        assert_eq!(window.last_message_sender_user_id, 1);
        assert!(!window.last_message_seen_by_recipient);
    }

    #[tokio::test]
    async fn test_send_rejects_non_participant() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        seed_user(&node.repository, 3, "Bob", "exhibitor").await;
        let eve = seed_user(&node.repository, 5, "Eve", "visitor").await;
        let uid = node.router.initiate(&ada, 3).await.unwrap();

        let (eve_session, _eve_client) = node.connect(&eve).await;
        let err = node.router.send(eve_session.id(), &uid, "hi").await.unwrap_err();
        assert_eq!(err.error_code(), "permission_denied");
        assert!(node.repository.list_chat_messages(&uid).await.unwrap().is_empty());

        let err = node.router.send(eve_session.id(), "no-such-window", "hi").await.unwrap_err();
        assert_eq!(err.error_code(), "not_found");
        let err = node.router.send("no-such-session", &uid, "hi").await.unwrap_err();
        assert_eq!(err.error_code(), "not_found");
    }

    #[tokio::test]
    async fn test_failed_insert_delivers_nothing() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node.repository, 3, "Bob", "exhibitor").await;
        let uid = node.router.initiate(&ada, 3).await.unwrap();
        let (a, _ada_client) = node.connect(&ada).await;
        let (_b, mut bob_client) = node.connect(&bob).await;

        sqlx::query("DROP TABLE chat_messages")
            .execute(&node.repository.pool)
            .await
            .unwrap();

        let err = node.router.send(a.id(), &uid, "lost").await.unwrap_err();
        assert_eq!(err.error_code(), "persistence_failure");
        assert_no_text(&mut bob_client, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_remote_session_gets_one_bus_copy() {
        let (node_a, node_b, _tmp) = test_fleet().await;
        let ada = seed_user(&node_a.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node_a.repository, 3, "Bob", "exhibitor").await;
        let uid = node_a.router.initiate(&ada, 3).await.unwrap();

        let (a, _ada_client) = node_a.connect(&ada).await;
        let (b, _bob_client) = node_b.connect(&bob).await;

        let mut tap = node_a.bus.subscribe().await.unwrap();
        let report = node_a.router.send(a.id(), &uid, "across").await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.published, 1);

        let payload = tap.next().await.unwrap();
        let envelope = OutgoingEnvelope::decode(&payload).unwrap();
        assert_eq!(envelope.to_connection.as_deref(), Some(b.id()));
        assert_eq!(envelope.event, Event::NewMessage);

        let nothing_else =
            tokio::time::timeout(Duration::from_millis(100), tap.next()).await;
        assert!(nothing_else.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_session_receives_through_peer_subscriber() {
        let (node_a, node_b, _tmp) = test_fleet().await;
        let ada = seed_user(&node_a.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node_a.repository, 3, "Bob", "exhibitor").await;
        let uid = node_a.router.initiate(&ada, 3).await.unwrap();

        let (a, _ada_client) = node_a.connect(&ada).await;
        let (_b, mut bob_client) = node_b.connect(&bob).await;

        let cancel = start_subscribers(&[&node_a, &node_b]).await;

        node_a.router.send(a.id(), &uid, "across").await.unwrap();

        let text = tokio::task::spawn_blocking(move || read_text(&mut bob_client))
            .await
            .unwrap();
        let envelope = OutgoingEnvelope::decode(&text).unwrap();
        assert_eq!(envelope.event, Event::NewMessage);
        let payload: MessagePayload = envelope.payload_as().unwrap();
        assert_eq!(payload.message, "across");
        cancel.cancel();
    }

    /// Run a bus subscriber per node and wait until all of them listen.
    async fn start_subscribers(nodes: &[&TestNode]) -> CancellationToken {
        let cancel = CancellationToken::new();
        for node in nodes {
            tokio::spawn(run_subscriber(
                node.bus.clone(),
                node.registry.clone(),
                node.metrics.clone(),
                Duration::from_millis(50),
                cancel.clone(),
            ));
        }
        let ready = OutgoingEnvelope::welcome(0, "ready");
        while nodes[0].bus.publish(&ready).await.unwrap() < nodes.len() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initiate_reaches_user_connected_to_another_instance() {
        let (node_a, node_b, _tmp) = test_fleet().await;
        let ada = seed_user(&node_a.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node_b.repository, 3, "Bob", "exhibitor").await;

        // Bob lives on B only; A has never cached him
        let (_b, bob_client) = node_b.connect(&bob).await;
        let (a, mut ada_client) = node_a.connect(&ada).await;
        let cancel = start_subscribers(&[&node_a, &node_b]).await;

        let uid = node_a.router.initiate(&ada, 3).await.unwrap();
        let local = OutgoingEnvelope::decode(&read_text(&mut ada_client)).unwrap();
        assert_eq!(local.event, Event::InitChat);

        let (text, bob_client) = tokio::task::spawn_blocking(move || {
            let mut client = bob_client;
            (read_text(&mut client), client)
        })
        .await
        .unwrap();
        let init = OutgoingEnvelope::decode(&text).unwrap();
        assert_eq!(init.event, Event::InitChat);
        assert_eq!(init.chat_window_id.as_deref(), Some(uid.as_str()));
        // B sees the window A created
        assert!(node_b.directory.chat_window(&uid, false).await.unwrap().is_some());

        let report = node_a.router.send(a.id(), &uid, "hi from A").await.unwrap();
        assert_eq!(report.published, 1);
        let text = tokio::task::spawn_blocking(move || {
            let mut client = bob_client;
            read_text(&mut client)
        })
        .await
        .unwrap();
        let payload: MessagePayload = OutgoingEnvelope::decode(&text).unwrap().payload_as().unwrap();
        assert_eq!(payload.message, "hi from A");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_init_chat_hides_session_ids() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node.repository, 3, "Bob", "exhibitor").await;
        let (a, _ada_client) = node.connect(&ada).await;
        let (_b, mut bob_client) = node.connect(&bob).await;

        let uid = node.router.initiate(&ada, 3).await.unwrap();

        let text = read_text(&mut bob_client);
        assert!(!text.contains(a.id()));
        let envelope = OutgoingEnvelope::decode(&text).unwrap();
        for participant in envelope.payload["participants"].as_array().unwrap() {
            assert!(participant.get("connections").is_none());
        }

        let cached = node.directory.chat_window(&uid, false).await.unwrap().unwrap();
        let cached_ada = cached.participants.iter().find(|p| p.user_id == 1).unwrap();
        assert_eq!(cached_ada.connections, vec![a.id().to_string()]);
    }
}
