use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_protocol::{TEXT_MESSAGE, participants_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub created_at: i64,
    pub user_id: u64,
    #[serde(rename = "username")]
    pub name: String,
    #[serde(rename = "type")]
    pub user_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    /// Live session ids in attach order, across every instance.
    #[serde(default)]
    pub connections: Vec<String>,
    #[serde(skip)]
    pub last_auth_token: Option<String>,
}

impl User {
    pub fn new(user_id: u64, name: impl Into<String>, user_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            created_at: Utc::now().timestamp(),
            user_id,
            name: name.into(),
            user_type: user_type.into(),
            email: None,
            phone_no: None,
            profile_picture: None,
            connections: Vec::new(),
            last_auth_token: None,
        }
    }

    /// Add a session id to the connection set. Returns false if already present.
    pub fn attach(&mut self, session_id: &str) -> bool {
        if self.connections.iter().any(|c| c == session_id) {
            return false;
        }
        self.connections.push(session_id.to_string());
        true
    }

    /// Remove a session id from the connection set. Returns false if absent.
    pub fn detach(&mut self, session_id: &str) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c != session_id);
        self.connections.len() != before
    }
}

/// A user as other clients see it. Session ids never leave the relay: each
/// one is a capability for the session it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: i64,
    pub created_at: i64,
    pub user_id: u64,
    #[serde(rename = "username")]
    pub name: String,
    #[serde(rename = "type")]
    pub user_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            created_at: user.created_at,
            user_id: user.user_id,
            name: user.name.clone(),
            user_type: user.user_type.clone(),
            email: user.email.clone(),
            phone_no: user.phone_no.clone(),
            profile_picture: user.profile_picture.clone(),
        }
    }
}

/// Durable record of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub session_id: String,
    pub user_id: u64,
    pub instance_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatWindow {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub created_at: i64,
    pub uid: String,
    pub participants: Vec<User>,
    pub participants_key: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_message_at: Option<i64>,
    #[serde(default)]
    pub last_message_sender: String,
    #[serde(default)]
    pub last_message_sender_user_id: u64,
    #[serde(default)]
    pub last_message_seen_by_recipient: bool,
}

impl ChatWindow {
    pub fn new(initiator: &User, recipient: &User) -> Self {
        Self {
            id: 0,
            created_at: Utc::now().timestamp(),
            uid: Uuid::new_v4().to_string(),
            participants: vec![initiator.clone(), recipient.clone()],
            participants_key: participants_key(initiator.user_id, recipient.user_id),
            last_message: String::new(),
            last_message_at: None,
            last_message_sender: String::new(),
            last_message_sender_user_id: 0,
            last_message_seen_by_recipient: false,
        }
    }

    pub fn has_participant(&self, user_id: u64) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    /// The participant that is not `user_id`.
    pub fn counterpart(&self, user_id: u64) -> Option<&User> {
        self.participants.iter().find(|p| p.user_id != user_id)
    }

    pub fn public_participants(&self) -> Vec<PublicUser> {
        self.participants.iter().map(PublicUser::from).collect()
    }

    pub fn record_message(&mut self, sender: &User, message: &str, at: i64) {
        self.last_message = message.to_string();
        self.last_message_at = Some(at);
        self.last_message_sender = sender.name.clone();
        self.last_message_sender_user_id = sender.user_id;
        self.last_message_seen_by_recipient = false;
    }
}

/// A chat window as its participants see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicChatWindow {
    pub id: i64,
    pub created_at: i64,
    pub uid: String,
    pub participants: Vec<PublicUser>,
    pub participants_key: String,
    pub last_message: String,
    pub last_message_at: Option<i64>,
    pub last_message_sender: String,
    pub last_message_sender_user_id: u64,
    pub last_message_seen_by_recipient: bool,
}

impl From<&ChatWindow> for PublicChatWindow {
    fn from(window: &ChatWindow) -> Self {
        Self {
            id: window.id,
            created_at: window.created_at,
            uid: window.uid.clone(),
            participants: window.public_participants(),
            participants_key: window.participants_key.clone(),
            last_message: window.last_message.clone(),
            last_message_at: window.last_message_at,
            last_message_sender: window.last_message_sender.clone(),
            last_message_sender_user_id: window.last_message_sender_user_id,
            last_message_seen_by_recipient: window.last_message_seen_by_recipient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Option<i64>, // None until inserted
    #[serde(rename = "type")]
    pub message_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub sender: u64,
    pub chat_window_uid: String,
    pub created_at: i64,
}

impl ChatMessage {
    pub fn text(chat_window_uid: &str, sender: u64, message: &str) -> Self {
        Self {
            id: None,
            message_type: TEXT_MESSAGE.to_string(),
            message: message.to_string(),
            image_url: None,
            sender,
            chat_window_uid: chat_window_uid.to_string(),
            created_at: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_set_is_ordered_and_unique() {
        let mut user = User::new(1, "Ada", "visitor");
        assert!(user.attach("s1"));
        assert!(user.attach("s2"));
        assert!(!user.attach("s1"));
        assert_eq!(user.connections, vec!["s1", "s2"]);

        assert!(user.detach("s1"));
        assert!(!user.detach("s1"));
        assert_eq!(user.connections, vec!["s2"]);
    }

    #[test]
    fn test_user_json_field_names() {
        let mut user = User::new(42, "Ada", "visitor");
        user.last_auth_token = Some("secret".into());
        user.attach("s1");

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["userId"], 42);
        assert_eq!(json["username"], "Ada");
        assert_eq!(json["type"], "visitor");
        assert_eq!(json["connections"][0], "s1");
        assert!(json.get("lastAuthToken").is_none());
        assert!(json.get("email").is_none());

        let back: User = serde_json::from_value(json).unwrap();
        assert_eq!(back.user_id, 42);
        assert!(back.last_auth_token.is_none());
    }

    #[test]
    fn test_chat_window_participants() {
        let a = User::new(3, "Ada", "visitor");
        let b = User::new(1, "Bob", "exhibitor");
        let window = ChatWindow::new(&a, &b);

        assert_eq!(window.participants_key, "1&3");
        assert!(window.has_participant(1));
        assert!(window.has_participant(3));
        assert!(!window.has_participant(2));
        assert_eq!(window.counterpart(3).map(|u| u.user_id), Some(1));
        assert_eq!(Uuid::parse_str(&window.uid).unwrap().get_version_num(), 4);
    }

    #[test]
    fn test_record_message_resets_seen_flag() {
        let a = User::new(1, "Ada", "visitor");
        let b = User::new(2, "Bob", "exhibitor");
        let mut window = ChatWindow::new(&a, &b);
        window.last_message_seen_by_recipient = true;

        window.record_message(&a, "hi", 1000);

        assert_eq!(window.last_message, "hi");
        assert_eq!(window.last_message_at, Some(1000));
        assert_eq!(window.last_message_sender, "Ada");
        assert_eq!(window.last_message_sender_user_id, 1);
        assert!(!window.last_message_seen_by_recipient);
    }

    #[test]
    fn test_public_views_carry_no_session_ids() {
        let mut a = User::new(1, "Ada", "visitor");
        a.attach("secret-session");
        a.last_auth_token = Some("secret-token".into());
        a.email = Some("ada@example.com".into());
        let b = User::new(2, "Bob", "exhibitor");
        let window = ChatWindow::new(&a, &b);

        let json = serde_json::to_value(PublicChatWindow::from(&window)).unwrap();
        let text = json.to_string();
        assert!(!text.contains("secret-session"));
        assert!(!text.contains("secret-token"));
        assert!(json["participants"][0].get("connections").is_none());
        assert_eq!(json["participants"][0]["username"], "Ada");
        assert_eq!(json["participants"][0]["email"], "ada@example.com");
        assert_eq!(json["participantsKey"], "1&2");

        // The internal copy still carries the session set
        let full = serde_json::to_value(&window).unwrap();
        assert_eq!(full["participants"][0]["connections"][0], "secret-session");
    }

    #[test]
    fn test_chat_message_serialization() {
        let msg = ChatMessage::text("w1", 7, "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "txt");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["sender"], 7);
        assert_eq!(json["chatWindowUid"], "w1");
        assert!(json.get("imageUrl").is_none());
    }
}
