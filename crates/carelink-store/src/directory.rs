use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use carelink_core::UNKNOWN_SENDER;

use crate::persist::KvStore;

/// A counterpart the owner has exchanged messages with. Derived from
/// observed traffic or added explicitly from the care-team directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_message_time: i64,
    #[serde(default)]
    pub is_starred: bool,
}

impl Contact {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            avatar: String::new(),
            last_message: String::new(),
            last_message_time: 0,
            is_starred: false,
        }
    }
}

/// Contact list derived from message traffic and persisted after every
/// mutation, so a reload can rehydrate without re-walking full history.
/// At most one contact exists per participant id; lookup always precedes
/// creation.
pub struct ContactDirectory {
    contacts: Vec<Contact>,
    store: Arc<dyn KvStore>,
    key: String,
    owner_id: String,
}

impl ContactDirectory {
    pub fn new(store: Arc<dyn KvStore>, owner_id: &str) -> Self {
        Self {
            contacts: Vec::new(),
            store,
            key: format!("contacts_{owner_id}"),
            owner_id: owner_id.to_string(),
        }
    }

    /// Load the persisted contact list. Runs before any transport
    /// activity; read or parse failures degrade to an empty directory.
    pub fn rehydrate(&mut self) {
        match self.store.get(&self.key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Contact>>(&raw) {
                Ok(contacts) => {
                    debug!(count = contacts.len(), "Rehydrated contact list");
                    self.contacts = contacts;
                }
                Err(e) => warn!(error = %e, "Stored contact list unreadable, starting empty"),
            },
            Ok(None) => debug!("No persisted contact list"),
            Err(e) => warn!(error = %e, "Contact list read failed, starting empty"),
        }
    }

    /// Record a message involving `counterpart_id`. Creates the contact on
    /// first sight, otherwise updates `last_message` metadata in place —
    /// but only when the observed message is not older than what the
    /// directory already has (reconciliation prefers fresher data).
    /// Returns whether a new contact was created.
    pub fn observe(
        &mut self,
        counterpart_id: &str,
        name_hint: Option<&str>,
        text: &str,
        timestamp: i64,
    ) -> bool {
        if counterpart_id.is_empty() {
            debug!("Ignoring message with no attributable counterpart");
            return false;
        }
        if counterpart_id == self.owner_id {
            debug!("Ignoring self-addressed message for contact derivation");
            return false;
        }

        if let Some(contact) = self.contacts.iter_mut().find(|c| c.id == counterpart_id) {
            if timestamp >= contact.last_message_time {
                contact.last_message = text.to_string();
                contact.last_message_time = timestamp;
                if contact.name == UNKNOWN_SENDER {
                    if let Some(name) = name_hint.filter(|n| !n.is_empty()) {
                        contact.name = name.to_string();
                    }
                }
                self.persist();
            }
            return false;
        }

        let name = name_hint
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_SENDER);
        let mut contact = Contact::new(counterpart_id, name);
        contact.last_message = text.to_string();
        contact.last_message_time = timestamp;
        debug!(id = counterpart_id, "New contact derived from traffic");
        self.contacts.push(contact);
        self.persist();
        true
    }

    /// Explicit creation path (the user picked a counterpart from the
    /// care-team directory). Takes precedence over derivation: display
    /// fields are overwritten, derived metadata is kept. Returns whether
    /// the contact was newly added.
    pub fn add(&mut self, contact: Contact) -> bool {
        if let Some(existing) = self.contacts.iter_mut().find(|c| c.id == contact.id) {
            existing.name = contact.name;
            existing.avatar = contact.avatar;
            self.persist();
            return false;
        }
        self.contacts.push(contact);
        self.persist();
        true
    }

    /// Local-only star flag. Returns false for an unknown id.
    pub fn set_starred(&mut self, id: &str, starred: bool) -> bool {
        match self.contacts.iter_mut().find(|c| c.id == id) {
            Some(contact) => {
                contact.is_starred = starred;
                self.persist();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == id)
    }

    /// Snapshot sorted by most recent activity first.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut sorted = self.contacts.clone();
        sorted.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        sorted
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Serialize the full list. Failures are logged and swallowed: the
    /// directory keeps operating on its in-memory state.
    fn persist(&self) {
        let raw = match serde_json::to_string(&self.contacts) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Contact list serialization failed");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.key, &raw) {
            warn!(error = %e, "Contact list persist failed, continuing in memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::persist::MemoryStore;

    fn directory() -> (ContactDirectory, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ContactDirectory::new(store.clone(), "7"), store)
    }

    #[test]
    fn test_first_message_creates_contact() {
        let (mut dir, _) = directory();
        let created = dir.observe("42", Some("Maria"), "hi", 1_700_000_000_000);
        assert!(created);

        let contact = dir.get("42").unwrap();
        assert_eq!(contact.name, "Maria");
        assert_eq!(contact.last_message, "hi");
        assert_eq!(contact.last_message_time, 1_700_000_000_000);
    }

    #[test]
    fn test_second_message_updates_without_duplicate() {
        let (mut dir, _) = directory();
        dir.observe("42", Some("Maria"), "hi", 1_700_000_000_000);
        let created = dir.observe("42", Some("Maria"), "again", 1_700_000_100_000);

        assert!(!created);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get("42").unwrap().last_message, "again");
    }

    #[test]
    fn test_older_observation_does_not_regress_metadata() {
        let (mut dir, _) = directory();
        dir.observe("42", None, "newest", 2_000);
        dir.observe("42", None, "stale history", 1_000);
        assert_eq!(dir.get("42").unwrap().last_message, "newest");
    }

    #[test]
    fn test_placeholder_name_upgraded_on_later_hint() {
        let (mut dir, _) = directory();
        dir.observe("42", None, "hi", 1_000);
        assert_eq!(dir.get("42").unwrap().name, UNKNOWN_SENDER);

        dir.observe("42", Some("Maria"), "hello", 2_000);
        assert_eq!(dir.get("42").unwrap().name, "Maria");
    }

    #[test]
    fn test_explicit_add_takes_precedence_over_derivation() {
        let (mut dir, _) = directory();
        dir.observe("42", Some("Unknown-ish"), "hi", 1_000);

        let mut picked = Contact::new("42", "Dr. Rossi");
        picked.avatar = "avatars/rossi.png".into();
        assert!(!dir.add(picked));

        dir.observe("42", Some("someone else"), "later", 2_000);
        let contact = dir.get("42").unwrap();
        assert_eq!(contact.name, "Dr. Rossi");
        assert_eq!(contact.avatar, "avatars/rossi.png");
        assert_eq!(contact.last_message, "later");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_rehydrate_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut dir = ContactDirectory::new(store.clone(), "7");
            dir.observe("42", Some("Maria"), "hi", 1_000);
            dir.set_starred("42", true);
        }

        let mut reloaded = ContactDirectory::new(store, "7");
        reloaded.rehydrate();
        let contact = reloaded.get("42").unwrap();
        assert_eq!(contact.name, "Maria");
        assert!(contact.is_starred);
    }

    #[test]
    fn test_rehydrate_garbage_degrades_to_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set("contacts_7", "not json").unwrap();
        let mut dir = ContactDirectory::new(store, "7");
        dir.rehydrate();
        assert!(dir.is_empty());
    }

    #[test]
    fn test_contacts_sorted_by_recency_descending() {
        let (mut dir, _) = directory();
        dir.observe("42", None, "old", 1_000);
        dir.observe("43", None, "new", 3_000);
        dir.observe("44", None, "middle", 2_000);

        let ids: Vec<String> = dir.contacts().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, ["43", "44", "42"]);
    }

    #[test]
    fn test_self_and_empty_counterparts_ignored() {
        let (mut dir, _) = directory();
        assert!(!dir.observe("7", Some("me"), "note to self", 1_000));
        assert!(!dir.observe("", None, "legacy", 1_000));
        assert!(dir.is_empty());
    }

    struct FailingStore;

    impl KvStore for FailingStore {
        fn get(&self, _key: &str) -> crate::error::Result<Option<String>> {
            Err(PersistenceError::NoDataDir)
        }
        fn set(&self, _key: &str, _value: &str) -> crate::error::Result<()> {
            Err(PersistenceError::NoDataDir)
        }
    }

    #[test]
    fn test_persistence_failure_keeps_directory_operational() {
        let mut dir = ContactDirectory::new(Arc::new(FailingStore), "7");
        dir.rehydrate();
        assert!(dir.observe("42", Some("Maria"), "hi", 1_000));
        assert_eq!(dir.get("42").unwrap().last_message, "hi");
    }
}
