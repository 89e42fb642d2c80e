//! Application envelope carried inside text frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::codec::Frame;

/// Class of messages originated by the server itself.
pub const CLASS_SERVER: &str = "Server";
/// Class of replies to dispatched requests.
pub const CLASS_RESPONSE: &str = "Response";

/// Actions used with [`CLASS_SERVER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Telemetry,
    Stats,
    AsyncError,
    Heartbeat,
    ClearCache,
    ActiveSessionsChanged,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Telemetry => "Telemetry",
            ControlAction::Stats => "Stats",
            ControlAction::AsyncError => "AsyncError",
            ControlAction::Heartbeat => "Heartbeat",
            ControlAction::ClearCache => "ClearCache",
            ControlAction::ActiveSessionsChanged => "ActiveSessionsChanged",
        }
    }

    pub fn parse(action: &str) -> Option<Self> {
        [
            ControlAction::Telemetry,
            ControlAction::Stats,
            ControlAction::AsyncError,
            ControlAction::Heartbeat,
            ControlAction::ClearCache,
            ControlAction::ActiveSessionsChanged,
        ]
        .into_iter()
        .find(|candidate| candidate.as_str() == action)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "MessageClass")]
    pub class: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Entity", default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(rename = "Value", default)]
    pub value: Value,
}

impl Message {
    pub fn control(action: ControlAction, value: Value) -> Self {
        Self {
            class: CLASS_SERVER.to_string(),
            action: action.as_str().to_string(),
            entity: None,
            value,
        }
    }

    pub fn async_error(message: &str) -> Self {
        Self::control(ControlAction::AsyncError, Value::String(message.to_string()))
    }

    pub fn response(entity: &str, action: &str, value: Value) -> Self {
        Self {
            class: CLASS_RESPONSE.to_string(),
            action: action.to_string(),
            entity: Some(entity.to_string()),
            value,
        }
    }

    /// Parses a decoded frame. Logs and yields `None` for anything that is
    /// not a JSON message object.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match serde_json::from_slice::<Message>(&frame.payload) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Discarding frame that is not a valid message: {}", e);
                None
            }
        }
    }

    pub fn control_action(&self) -> Option<ControlAction> {
        if self.class == CLASS_SERVER {
            ControlAction::parse(&self.action)
        } else {
            None
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a struct of strings and a Value cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::codec::Opcode;
    use serde_json::json;

    fn frame_of(text: &str) -> Frame {
        Frame {
            fin: true,
            opcode: Opcode::Text,
            masked: true,
            mask_key: Some([1, 2, 3, 4]),
            payload_length: text.len() as u64,
            payload: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_parses_wire_keys() {
        let frame = frame_of(
            r#"{"MessageClass":"Request","Action":"Login","Entity":"Account","Value":{"Email":"a@b.c"}}"#,
        );
        let message = Message::from_frame(&frame).unwrap();
        assert_eq!(message.class, "Request");
        assert_eq!(message.entity.as_deref(), Some("Account"));
        assert_eq!(message.value, json!({"Email": "a@b.c"}));
    }

    #[test]
    fn test_invalid_json_is_dropped() {
        assert!(Message::from_frame(&frame_of("{not json")).is_none());
        assert!(Message::from_frame(&frame_of(r#"{"Action":"x"}"#)).is_none());
    }

    #[test]
    fn test_async_error_shape() {
        let wire: Value = serde_json::from_str(&Message::async_error("boom").to_json()).unwrap();
        assert_eq!(
            wire,
            json!({"MessageClass": "Server", "Action": "AsyncError", "Value": "boom"})
        );
    }

    #[test]
    fn test_control_action_lookup() {
        let heartbeat = Message::control(ControlAction::Heartbeat, Value::Null);
        assert_eq!(heartbeat.control_action(), Some(ControlAction::Heartbeat));
        let reply = Message::response("Account", "Heartbeat", Value::Null);
        assert_eq!(reply.control_action(), None);
    }
}
