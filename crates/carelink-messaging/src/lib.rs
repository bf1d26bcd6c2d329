mod error;
mod events;
mod service;

pub use error::MessagingError;
pub use events::MessagingEvent;
pub use service::{MessagingService, Topology, DEFAULT_REFRESH_INTERVAL, HISTORY_LIMIT};

pub use carelink_core::{direct_channel, ConnectionStatus, Message, WirePayload, DEFAULT_SHARED_CHANNEL};
pub use carelink_store::{Contact, ContactDirectory, ConversationStore, KvStore};
pub use carelink_transport::{Transport, TransportError};
