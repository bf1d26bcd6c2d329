use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::WirePayload;

/// Coarse connection state reflected from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Frames sent from the client to the pub/sub gateway.
///
/// `Publish` and `History` carry a client-chosen correlation `id` that the
/// gateway echoes back in the matching ack/result frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { id: String, channel: String, payload: WirePayload, store_in_history: bool },
    History { id: String, channel: String, limit: u32 },
}

/// Frames received from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ProviderFrame {
    Subscribed { channel: String },
    Message { channel: String, timetoken: String, published_at: Option<Value>, payload: WirePayload },
    PublishAck { id: String, timetoken: String, published_at: Option<Value> },
    PublishError { id: String, error: String },
    HistoryResult { id: String, entries: Vec<HistoryEntry> },
    HistoryError { id: String, error: String },
    Status { state: ConnectionStatus },
}

/// One retained message as returned by the gateway's history call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timetoken: String,
    pub published_at: Option<Value>,
    pub payload: WirePayload,
}
