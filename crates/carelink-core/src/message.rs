use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalize::{display_name, normalize_timestamp};

/// Fully-defaulted internal representation of a wire message.
///
/// `id` is the gateway-assigned timetoken: unique per message and monotonic
/// within a channel, so it doubles as the dedup key and the sort tiebreak.
/// Instances are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub sender_name: String,
    pub text: String,
    /// Milliseconds since the Unix epoch, normalized.
    pub timestamp: i64,
}

impl Message {
    /// Build a canonical message from a gateway envelope. Infallible: every
    /// missing or malformed field falls back to a default.
    pub fn from_wire(timetoken: &str, payload: &WirePayload, published_at: Option<&Value>) -> Self {
        let raw_ts = payload.timestamp.as_ref().or(published_at);
        Self {
            id: timetoken.to_string(),
            sender_id: payload.sender_id.clone().unwrap_or_default(),
            receiver_id: payload.receiver_id.clone().unwrap_or_default(),
            sender_name: display_name(payload),
            text: payload.text.clone().unwrap_or_default(),
            timestamp: normalize_timestamp(raw_ts),
        }
    }

    /// Whether this message travels between `contact` and `me`, in either
    /// direction. Used to pick a pair's messages out of shared-channel
    /// traffic.
    pub fn is_between(&self, contact: &str, me: &str) -> bool {
        (self.sender_id == contact && self.receiver_id == me)
            || (self.sender_id == me && self.receiver_id == contact)
    }

    /// The participant on the other side of this message from `me`.
    /// `None` when the message does not involve `me` at all, or when the
    /// counterpart field is empty (legacy payloads).
    pub fn counterpart_of(&self, me: &str) -> Option<&str> {
        let other = if self.sender_id == me {
            &self.receiver_id
        } else if self.receiver_id == me {
            &self.sender_id
        } else {
            return None;
        };
        if other.is_empty() || other == me {
            None
        } else {
            Some(other)
        }
    }
}

/// The duck-typed payload that crosses the transport boundary. Every field
/// is optional; the normalizer fills the gaps on the way in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WirePayload {
    pub sender: Option<String>,
    pub text: Option<String>,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub sender_name: Option<String>,
    pub receiver_name: Option<String>,
    /// Seconds, milliseconds, or a numeric string; normalized on receipt.
    pub timestamp: Option<Value>,
}

impl WirePayload {
    pub fn outgoing(sender_id: &str, sender_name: &str, receiver_id: &str, text: &str) -> Self {
        Self {
            sender: Some(sender_name.to_string()),
            text: Some(text.to_string()),
            sender_id: Some(sender_id.to_string()),
            receiver_id: Some(receiver_id.to_string()),
            sender_name: Some(sender_name.to_string()),
            receiver_name: None,
            timestamp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_payload_accepts_partial_json() {
        let payload: WirePayload =
            serde_json::from_value(json!({ "sender": "maria", "text": "hi" })).unwrap();
        assert_eq!(payload.sender.as_deref(), Some("maria"));
        assert_eq!(payload.sender_id, None);
        assert_eq!(payload.receiver_id, None);
    }

    #[test]
    fn test_from_wire_defaults_empty_ids() {
        let payload: WirePayload = serde_json::from_value(json!({ "text": "hello" })).unwrap();
        let msg = Message::from_wire("100", &payload, Some(&json!(1700000000)));
        assert_eq!(msg.sender_id, "");
        assert_eq!(msg.receiver_id, "");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_is_between_either_direction() {
        let payload: WirePayload =
            serde_json::from_value(json!({ "senderId": "42", "receiverId": "7" })).unwrap();
        let msg = Message::from_wire("1", &payload, Some(&json!(1)));
        assert!(msg.is_between("42", "7"));
        assert!(msg.is_between("7", "42"));
        assert!(!msg.is_between("42", "9"));
    }

    #[test]
    fn test_counterpart_of() {
        let payload: WirePayload =
            serde_json::from_value(json!({ "senderId": "42", "receiverId": "7" })).unwrap();
        let msg = Message::from_wire("1", &payload, Some(&json!(1)));
        assert_eq!(msg.counterpart_of("7"), Some("42"));
        assert_eq!(msg.counterpart_of("42"), Some("7"));
        assert_eq!(msg.counterpart_of("9"), None);
    }

    #[test]
    fn test_counterpart_of_empty_field() {
        let payload: WirePayload =
            serde_json::from_value(json!({ "senderId": "42", "receiverId": "" })).unwrap();
        let msg = Message::from_wire("1", &payload, Some(&json!(1)));
        // Inbound side can still attribute the sender, the sender side cannot.
        assert_eq!(msg.counterpart_of("42"), None);
    }
}
