use std::collections::HashMap;

use carelink_core::Message;

/// Per-contact message lists, deduplicated by message id and kept in
/// ascending `(timestamp, id)` order. Live deliveries and history replay
/// converge to the same sequence regardless of arrival order.
#[derive(Default)]
pub struct ConversationStore {
    conversations: HashMap<String, Vec<Message>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a live-delivered message. Duplicates by id are ignored;
    /// out-of-order arrivals are placed at their sorted position. Returns
    /// whether the message was new.
    pub fn append_live(&mut self, contact_id: &str, message: Message) -> bool {
        let list = self.conversations.entry(contact_id.to_string()).or_default();
        if list.iter().any(|m| m.id == message.id) {
            return false;
        }
        let pos = list
            .iter()
            .rposition(|m| (m.timestamp, m.id.as_str()) <= (message.timestamp, message.id.as_str()))
            .map(|i| i + 1)
            .unwrap_or(0);
        list.insert(pos, message);
        true
    }

    /// Merge a history batch with whatever live messages are already
    /// buffered. Idempotent: replaying the same batch changes nothing.
    /// Returns the number of messages actually added.
    pub fn backfill_history(&mut self, contact_id: &str, batch: Vec<Message>) -> usize {
        let list = self.conversations.entry(contact_id.to_string()).or_default();
        let mut added = 0;
        for message in batch {
            if !list.iter().any(|m| m.id == message.id) {
                list.push(message);
                added += 1;
            }
        }
        if added > 0 {
            list.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        }
        added
    }

    /// Shared-channel backfill: the batch carries every pair's traffic, so
    /// only messages between `contact_id` and `self_id` (either direction)
    /// are merged in.
    pub fn backfill_shared(
        &mut self,
        contact_id: &str,
        self_id: &str,
        batch: Vec<Message>,
    ) -> usize {
        let filtered: Vec<Message> = batch
            .into_iter()
            .filter(|m| m.is_between(contact_id, self_id))
            .collect();
        self.backfill_history(contact_id, filtered)
    }

    /// Most recent message of a conversation, for contact metadata.
    pub fn last_message_of(&self, contact_id: &str) -> Option<&Message> {
        self.conversations.get(contact_id).and_then(|list| list.last())
    }

    pub fn messages(&self, contact_id: &str) -> &[Message] {
        self.conversations
            .get(contact_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Drop a conversation. The only path that removes messages.
    pub fn clear(&mut self, contact_id: &str) {
        self.conversations.remove(contact_id);
    }

    pub fn contact_ids(&self) -> Vec<String> {
        self.conversations.keys().cloned().collect()
    }
}
