use carelink_core::{ConnectionStatus, Message};

/// Push events for the front-end: new traffic, contact list changes,
/// connection state. Mirrors whatever the screens need to repaint.
#[derive(Debug, Clone)]
pub enum MessagingEvent {
    Ready,
    MessageReceived { contact_id: String, message: Message },
    ContactsUpdated,
    HistoryLoaded { contact_id: String, count: usize },
    StatusChanged(ConnectionStatus),
}
