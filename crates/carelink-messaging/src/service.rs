use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use carelink_core::{direct_channel, ConnectionStatus, Message, WirePayload};
use carelink_store::{Contact, ContactDirectory, ConversationStore, KvStore};
use carelink_transport::Transport;

use crate::error::Result;
use crate::events::MessagingEvent;

/// How often the contact list is re-derived from retained history.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Most recent messages requested per history call.
pub const HISTORY_LIMIT: u32 = 100;

/// How this participant's conversations map onto gateway channels.
/// Caregivers share one portal-wide channel and filter by pair; clinicians
/// get a channel per counterpart.
#[derive(Debug, Clone)]
pub enum Topology {
    Shared { channel: String },
    Direct,
}

struct State {
    conversations: ConversationStore,
    directory: ContactDirectory,
}

/// Orchestrates the messaging core: rehydrates the contact directory,
/// subscribes channels, backfills history, routes live traffic into the
/// stores and re-derives contacts on a timer. All mutations happen under
/// one state lock, never across an await, so readers only ever observe
/// fully-applied updates.
pub struct MessagingService {
    transport: Arc<Transport>,
    state: Arc<Mutex<State>>,
    self_id: String,
    self_name: String,
    topology: Topology,
    refresh_interval: Duration,
    event_tx: mpsc::UnboundedSender<MessagingEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<MessagingEvent>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingService {
    pub fn new(
        transport: Arc<Transport>,
        kv: Arc<dyn KvStore>,
        self_id: &str,
        self_name: &str,
        topology: Topology,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            state: Arc::new(Mutex::new(State {
                conversations: ConversationStore::new(),
                directory: ContactDirectory::new(kv, self_id),
            })),
            self_id: self_id.to_string(),
            self_name: self_name.to_string(),
            topology,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<MessagingEvent>> {
        self.event_rx.take()
    }

    /// Bring the service up: rehydrate the persisted contact list first,
    /// then subscribe, then backfill from retained history (non-fatal when
    /// empty), then start the periodic refresh.
    pub async fn start(&self) -> Result<()> {
        {
            self.state.lock().unwrap().directory.rehydrate();
        }
        let _ = self.event_tx.send(MessagingEvent::ContactsUpdated);

        match &self.topology {
            Topology::Shared { channel } => {
                self.subscribe_channel(channel)?;
            }
            Topology::Direct => {
                let contact_ids: Vec<String> = {
                    let state = self.state.lock().unwrap();
                    state.directory.contacts().into_iter().map(|c| c.id).collect()
                };
                for id in contact_ids {
                    self.subscribe_channel(&direct_channel(&self.self_id, &id))?;
                }
            }
        }

        sync_from_history(
            &self.transport,
            &self.state,
            &self.event_tx,
            &self.self_id,
            &self.topology,
        )
        .await;

        self.spawn_refresh();
        self.spawn_status_forwarder();

        info!(self_id = %self.self_id, topology = ?self.topology, "Messaging service started");
        let _ = self.event_tx.send(MessagingEvent::Ready);
        Ok(())
    }

    /// Publish a message to a counterpart. The conversation and contact
    /// metadata are only touched after the gateway acknowledges; a
    /// rejected publish leaves every store unchanged so the caller can
    /// keep the user's input for a retry.
    pub async fn send_to(&self, contact_id: &str, text: &str) -> Result<Message> {
        let channel = match &self.topology {
            Topology::Shared { channel } => channel.clone(),
            Topology::Direct => direct_channel(&self.self_id, contact_id),
        };
        let payload = WirePayload::outgoing(&self.self_id, &self.self_name, contact_id, text);
        let message = self.transport.publish(&channel, payload).await?;

        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.conversations.append_live(contact_id, message.clone());
            state
                .directory
                .observe(contact_id, None, &message.text, message.timestamp);
        }
        let _ = self.event_tx.send(MessagingEvent::ContactsUpdated);
        Ok(message)
    }

    /// Explicitly register a counterpart picked from the care-team
    /// directory. In direct topology this also opens the pair channel.
    pub fn add_contact(&self, contact: Contact) -> Result<()> {
        let contact_id = contact.id.clone();
        {
            self.state.lock().unwrap().directory.add(contact);
        }
        if matches!(self.topology, Topology::Direct) {
            self.subscribe_channel(&direct_channel(&self.self_id, &contact_id))?;
        }
        let _ = self.event_tx.send(MessagingEvent::ContactsUpdated);
        Ok(())
    }

    /// Re-walk retained history and reconcile both stores. Also runs on
    /// the periodic timer; safe to overlap with live message handling.
    pub async fn refresh(&self) {
        sync_from_history(
            &self.transport,
            &self.state,
            &self.event_tx,
            &self.self_id,
            &self.topology,
        )
        .await;
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.state.lock().unwrap().directory.contacts()
    }

    pub fn messages_with(&self, contact_id: &str) -> Vec<Message> {
        self.state.lock().unwrap().conversations.messages(contact_id).to_vec()
    }

    pub fn set_starred(&self, contact_id: &str, starred: bool) -> bool {
        let changed = self.state.lock().unwrap().directory.set_starred(contact_id, starred);
        if changed {
            let _ = self.event_tx.send(MessagingEvent::ContactsUpdated);
        }
        changed
    }

    /// Drop a conversation's messages and release its channel in direct
    /// topology. The contact entry itself stays.
    pub fn clear_conversation(&self, contact_id: &str) {
        self.state.lock().unwrap().conversations.clear(contact_id);
        if matches!(self.topology, Topology::Direct) {
            self.transport.unsubscribe(&direct_channel(&self.self_id, contact_id));
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    /// Tear the service down: cancel the refresh timer and release every
    /// transport subscription. Safe to call more than once; transport
    /// results still in flight resolve as discarded.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.transport.cleanup();
        info!("Messaging service stopped");
    }

    fn subscribe_channel(&self, channel: &str) -> Result<()> {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let self_id = self.self_id.clone();
        self.transport.subscribe(channel, move |message| {
            route_live(&state, &event_tx, &self_id, message);
        })?;
        Ok(())
    }

    fn spawn_refresh(&self) {
        let transport = self.transport.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let self_id = self.self_id.clone();
        let topology = self.topology.clone();
        let interval = self.refresh_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; start() already backfilled.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        debug!("Periodic contact refresh");
                        sync_from_history(&transport, &state, &event_tx, &self_id, &topology).await;
                    }
                }
            }
            debug!("Refresh task stopped");
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_status_forwarder(&self) {
        let mut status = self.transport.status_watch();
        let event_tx = self.event_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *status.borrow_and_update();
                        let _ = event_tx.send(MessagingEvent::StatusChanged(state));
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }
}

impl Drop for MessagingService {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Route one live-delivered message into the stores. Runs synchronously on
/// the transport's dispatch path: the whole update is applied under one
/// lock acquisition before anything else observes it.
fn route_live(
    state: &Mutex<State>,
    event_tx: &mpsc::UnboundedSender<MessagingEvent>,
    self_id: &str,
    message: Message,
) {
    let Some(counterpart) = message.counterpart_of(self_id).map(str::to_string) else {
        debug!(
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            "Dropping message with no attributable counterpart"
        );
        return;
    };

    let inbound = message.sender_id != self_id;
    let name_hint = inbound.then(|| message.sender_name.clone());

    let is_new = {
        let mut guard = state.lock().unwrap();
        let state = &mut *guard;
        let is_new = state.conversations.append_live(&counterpart, message.clone());
        if is_new {
            state
                .directory
                .observe(&counterpart, name_hint.as_deref(), &message.text, message.timestamp);
        }
        is_new
    };

    if is_new {
        let _ = event_tx.send(MessagingEvent::MessageReceived {
            contact_id: counterpart,
            message,
        });
        let _ = event_tx.send(MessagingEvent::ContactsUpdated);
    }
}

/// Re-derive conversations and contacts from retained history. History
/// failures surface as empty batches and simply leave the stores as they
/// were; id-level dedup makes replays idempotent.
async fn sync_from_history(
    transport: &Transport,
    state: &Mutex<State>,
    event_tx: &mpsc::UnboundedSender<MessagingEvent>,
    self_id: &str,
    topology: &Topology,
) {
    match topology {
        Topology::Shared { channel } => {
            let messages = transport.history(channel, HISTORY_LIMIT).await;
            if messages.is_empty() {
                return;
            }

            let mut by_contact: HashMap<String, Vec<Message>> = HashMap::new();
            for message in messages {
                if let Some(counterpart) = message.counterpart_of(self_id) {
                    by_contact.entry(counterpart.to_string()).or_default().push(message);
                }
            }

            let mut loaded = Vec::new();
            {
                let mut guard = state.lock().unwrap();
                let state = &mut *guard;
                for (contact_id, batch) in by_contact {
                    let added = state.conversations.backfill_shared(&contact_id, self_id, batch);
                    reconcile_contact(state, self_id, &contact_id);
                    if added > 0 {
                        loaded.push((contact_id, added));
                    }
                }
            }

            for (contact_id, count) in loaded {
                let _ = event_tx.send(MessagingEvent::HistoryLoaded { contact_id, count });
            }
            let _ = event_tx.send(MessagingEvent::ContactsUpdated);
        }

        Topology::Direct => {
            let contact_ids: Vec<String> = {
                let state = state.lock().unwrap();
                state.directory.contacts().into_iter().map(|c| c.id).collect()
            };

            let mut any = false;
            for contact_id in contact_ids {
                let channel = direct_channel(self_id, &contact_id);
                let batch = transport.history(&channel, HISTORY_LIMIT).await;
                if batch.is_empty() {
                    continue;
                }

                let added = {
                    let mut guard = state.lock().unwrap();
                    let state = &mut *guard;
                    let added = state.conversations.backfill_history(&contact_id, batch);
                    reconcile_contact(state, self_id, &contact_id);
                    added
                };
                if added > 0 {
                    any = true;
                    let _ = event_tx.send(MessagingEvent::HistoryLoaded {
                        contact_id: contact_id.clone(),
                        count: added,
                    });
                }
            }
            if any {
                let _ = event_tx.send(MessagingEvent::ContactsUpdated);
            }
        }
    }
}

/// Push a conversation's most recent message into the contact entry.
/// `observe` keeps the newest data, so replaying older history is a no-op.
fn reconcile_contact(state: &mut State, self_id: &str, contact_id: &str) {
    if let Some(last) = state.conversations.last_message_of(contact_id) {
        let name_hint = (last.sender_id != self_id).then(|| last.sender_name.clone());
        let text = last.text.clone();
        let timestamp = last.timestamp;
        state
            .directory
            .observe(contact_id, name_hint.as_deref(), &text, timestamp);
    }
}
