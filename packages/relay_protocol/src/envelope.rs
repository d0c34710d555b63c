//! Outgoing envelopes: the unit written to client sessions and published on the
//! cross-instance bus.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ProtocolError;

/// `from` value for envelopes that originate from the relay itself.
pub const SYSTEM_SENDER: u64 = 0;

/// Message type tag carried in `NEW_MESSAGE` payloads.
pub const TEXT_MESSAGE: &str = "txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Welcome,
    NewMessage,
    InitChat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEnvelope {
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_window_id: Option<String>,
    pub from: u64,
    /// Target session; only set on bus traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_connection: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub user_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl OutgoingEnvelope {
    pub fn welcome(user_id: u64, session_id: &str) -> Self {
        Self {
            event: Event::Welcome,
            chat_window_id: None,
            from: SYSTEM_SENDER,
            to_connection: None,
            payload: json!({
                "userId": user_id.to_string(),
                "connectionId": session_id,
            }),
        }
    }

    pub fn new_message(chat_window_id: &str, from: u64, message: &str) -> Self {
        Self {
            event: Event::NewMessage,
            chat_window_id: Some(chat_window_id.to_string()),
            from,
            to_connection: None,
            payload: json!({
                "type": TEXT_MESSAGE,
                "message": message,
            }),
        }
    }

    /// `participants` is whatever representation of the two users clients expect.
    pub fn init_chat<P: Serialize>(
        chat_window_id: &str,
        from: u64,
        participants: &P,
    ) -> Result<Self, ProtocolError> {
        let participants = serde_json::to_value(participants)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        Ok(Self {
            event: Event::InitChat,
            chat_window_id: Some(chat_window_id.to_string()),
            from,
            to_connection: None,
            payload: json!({ "participants": participants }),
        })
    }

    /// Copy of this envelope addressed to one remote session.
    pub fn addressed_to(&self, session_id: &str) -> Self {
        Self {
            to_connection: Some(session_id.to_string()),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}
