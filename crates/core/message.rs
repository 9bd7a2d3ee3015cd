//! Message envelope and handler response types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action carried by the shutdown sentinel.
///
/// A consumer that receives a message with this action stops without invoking
/// its handler. Only `delete_queue` and `stop` send it.
pub const QUIT_ACTION: &str = "quit";

/// A unit of work published to a queue.
///
/// On the wire this is one flat JSON object: `action`, `repeat_count` and every
/// payload field side by side. Payload fields are carried through retries
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Caller-defined action, identifies handler behavior.
    pub action: String,
    /// Number of retry attempts already made.
    #[serde(default)]
    pub repeat_count: u32,
    /// Any other caller fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Message {
    /// Create a message with the given action and no payload.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            repeat_count: 0,
            payload: Map::new(),
        }
    }

    /// Create the shutdown sentinel.
    pub fn quit() -> Self {
        Self::new(QUIT_ACTION)
    }

    /// Add a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Get a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Whether this is the shutdown sentinel.
    pub fn is_quit(&self) -> bool {
        self.action == QUIT_ACTION
    }

    /// Copy of this message with `repeat_count` set to `tier`.
    pub fn for_tier(&self, tier: u32) -> Self {
        Self {
            repeat_count: tier,
            ..self.clone()
        }
    }

    /// Serialize the message to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a message from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Outcome reported by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Processed; acknowledge.
    Ok,
    /// Transient failure; retry with backoff.
    Retry,
    /// Permanent failure (bad data); drop without retry.
    Fail,
}

/// The handler's verdict on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HandlerResponse {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            message: None,
        }
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            status: Status::Retry,
            message: Some(message.into()),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            message: Some(message.into()),
        }
    }

    /// Attach a human-readable note.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repeat_count_defaults_to_zero() {
        let msg = Message::from_bytes(br#"{"action":"charge","order_id":"O1"}"#).unwrap();
        assert_eq!(msg.action, "charge");
        assert_eq!(msg.repeat_count, 0);
        assert_eq!(msg.field("order_id"), Some(&json!("O1")));
    }

    #[test]
    fn test_wire_format_is_flat() {
        let msg = Message::new("charge")
            .with_field("order_id", "O1")
            .with_field("amount", 42);
        let value: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"action": "charge", "repeat_count": 0, "order_id": "O1", "amount": 42})
        );
    }

    #[test]
    fn test_for_tier_keeps_payload() {
        let msg = Message::new("charge")
            .with_field("order_id", "O1")
            .with_field("nested", json!({"a": [1, 2]}));
        let next = msg.for_tier(2);
        assert_eq!(next.repeat_count, 2);
        assert_eq!(next.action, msg.action);
        assert_eq!(next.payload, msg.payload);
        assert_eq!(msg.repeat_count, 0);
    }

    #[test]
    fn test_quit_sentinel() {
        assert!(Message::quit().is_quit());
        assert!(!Message::new("charge").is_quit());
        let parsed = Message::from_bytes(br#"{"action":"quit"}"#).unwrap();
        assert!(parsed.is_quit());
    }

    #[test]
    fn test_missing_action_is_rejected() {
        assert!(Message::from_bytes(br#"{"repeat_count":1}"#).is_err());
        assert!(Message::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_handler_response_serialization() {
        let json = serde_json::to_value(HandlerResponse::retry("timeout")).unwrap();
        assert_eq!(json, json!({"status": "retry", "message": "timeout"}));

        let json = serde_json::to_value(HandlerResponse::ok()).unwrap();
        assert_eq!(json, json!({"status": "ok"}));

        let parsed: HandlerResponse = serde_json::from_value(json!({"status": "fail"})).unwrap();
        assert_eq!(parsed.status, Status::Fail);
        assert!(parsed.message.is_none());
    }
}
