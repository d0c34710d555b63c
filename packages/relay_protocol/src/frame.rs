//! Inbound client frames.
//!
//! Clients send one JSON object per text frame:
//!
//! ```json
//! {"action": "send", "chatWindowId": "…", "message": "hi"}
//! {"action": "init", "toUser": 42}
//! {"action": "disconnect"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Text written to every session by the liveness sweep. Clients may echo it.
pub const KEEPALIVE_FRAME: &str = "p";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Init,
    Send,
    Disconnect,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_window_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A frame after its required fields have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init { to_user: u64 },
    Send { chat_window_id: String, message: String },
    Disconnect,
    /// Unrecognised action; ignored by the relay.
    Ignore,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn into_command(self) -> Result<Command, ProtocolError> {
        match self.action {
            Action::Init => {
                let to_user = self.to_user.ok_or(ProtocolError::MissingField {
                    action: "init",
                    field: "toUser",
                })?;
                Ok(Command::Init { to_user })
            }
            Action::Send => {
                let chat_window_id = self.chat_window_id.ok_or(ProtocolError::MissingField {
                    action: "send",
                    field: "chatWindowId",
                })?;
                let message = self.message.ok_or(ProtocolError::MissingField {
                    action: "send",
                    field: "message",
                })?;
                Ok(Command::Send {
                    chat_window_id,
                    message,
                })
            }
            Action::Disconnect => Ok(Command::Disconnect),
            Action::Unknown => Ok(Command::Ignore),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_frame() {
        let frame =
            InboundFrame::parse(r#"{"action":"send","chatWindowId":"w1","message":"hi"}"#).unwrap();
        assert_eq!(frame.action, Action::Send);
        assert_eq!(
            frame.into_command().unwrap(),
            Command::Send {
                chat_window_id: "w1".into(),
                message: "hi".into()
            }
        );
    }

    #[test]
    fn parses_init_frame() {
        let frame = InboundFrame::parse(r#"{"action":"init","toUser":7}"#).unwrap();
        assert_eq!(frame.into_command().unwrap(), Command::Init { to_user: 7 });
    }

    #[test]
    fn unknown_action_is_ignored() {
        let frame = InboundFrame::parse(r#"{"action":"typing"}"#).unwrap();
        assert_eq!(frame.action, Action::Unknown);
        assert_eq!(frame.into_command().unwrap(), Command::Ignore);
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = InboundFrame::parse(r#"{"action":"send","message":"hi"}"#)
            .unwrap()
            .into_command()
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingField {
                action: "send",
                field: "chatWindowId"
            }
        );

        let err = InboundFrame::parse(r#"{"action":"init"}"#)
            .unwrap()
            .into_command()
            .unwrap_err();
        assert_eq!(err.error_code(), "missing_field");
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = InboundFrame::parse("{not json").unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");

        // The keepalive echo is not a frame either.
        assert!(InboundFrame::parse(KEEPALIVE_FRAME).is_err());
    }
}
