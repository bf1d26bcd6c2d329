use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to gateway: {0}")]
    Connect(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Gateway rejected request: {0}")]
    Rejected(String),

    #[error("Link closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
