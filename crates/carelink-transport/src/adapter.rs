use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use carelink_core::{ClientFrame, ConnectionStatus, Message, ProviderFrame, WirePayload};

use crate::error::{Result, TransportError};

/// Outgoing half of the gateway connection. Implementations enqueue the
/// frame and return immediately; delivery happens on the link's own writer
/// task. Tests substitute a channel-backed fake.
pub trait Link: Send + Sync {
    fn send(&self, frame: ClientFrame) -> Result<()>;
}

type Handler = Arc<dyn Fn(Message) + Send + Sync>;

/// Per-channel subscription lifecycle. `Subscribing` is left either on the
/// gateway's ack or on an early unsubscribe, in which case the late ack is
/// ignored.
enum SubState {
    Subscribing,
    Subscribed,
}

struct Subscription {
    state: SubState,
    handler: Handler,
}

enum Pending {
    Publish {
        payload: WirePayload,
        tx: oneshot::Sender<Result<Message>>,
    },
    History {
        channel: String,
        tx: oneshot::Sender<Result<Vec<Message>>>,
    },
}

#[derive(Default)]
struct Inner {
    subs: HashMap<String, Subscription>,
    pending: HashMap<String, Pending>,
    closed: bool,
}

/// The single shared adapter over the pub/sub gateway. Owns channel
/// subscriptions, publish acknowledgment and history retrieval; everything
/// else in the process talks to the gateway through this type only.
pub struct Transport {
    link: Box<dyn Link>,
    inner: Arc<Mutex<Inner>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Wire the adapter to a link. `intake` is the stream of frames the
    /// link's reader produces; a background pump dispatches them.
    pub fn new(link: Box<dyn Link>, intake: mpsc::UnboundedReceiver<ProviderFrame>) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let inner = Arc::new(Mutex::new(Inner::default()));

        let pump_inner = inner.clone();
        let pump = tokio::spawn(async move {
            let mut intake = intake;
            while let Some(frame) = intake.recv().await {
                dispatch(&pump_inner, &status_tx, frame);
            }
        });

        Self {
            link,
            inner,
            status_rx,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Subscribe to a channel. Idempotent: re-subscribing replaces the
    /// handler without a second gateway-level subscription, so no message
    /// is ever delivered twice.
    pub fn subscribe(
        &self,
        channel: &str,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(TransportError::NotConnected);
            }
            if let Some(sub) = inner.subs.get_mut(channel) {
                debug!(channel, "Already subscribed, replacing handler");
                sub.handler = Arc::new(handler);
                return Ok(());
            }
            inner.subs.insert(
                channel.to_string(),
                Subscription {
                    state: SubState::Subscribing,
                    handler: Arc::new(handler),
                },
            );
        }

        debug!(channel, "Subscribing");
        if let Err(e) = self.link.send(ClientFrame::Subscribe {
            channel: channel.to_string(),
        }) {
            self.inner.lock().unwrap().subs.remove(channel);
            return Err(e);
        }
        Ok(())
    }

    /// Unsubscribe from a channel. No-op when not subscribed. Live
    /// delivery for the channel stops immediately; a subscribe ack that
    /// arrives afterwards is ignored.
    pub fn unsubscribe(&self, channel: &str) {
        let removed = self.inner.lock().unwrap().subs.remove(channel).is_some();
        if removed {
            debug!(channel, "Unsubscribing");
            let _ = self.link.send(ClientFrame::Unsubscribe {
                channel: channel.to_string(),
            });
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.lock().unwrap().subs.contains_key(channel)
    }

    /// Publish a payload and wait for the gateway acknowledgment. Returns
    /// the canonical message built from the gateway-assigned timetoken.
    /// On any failure nothing has been appended anywhere, so the caller
    /// can keep the user's input and retry.
    pub async fn publish(&self, channel: &str, payload: WirePayload) -> Result<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(TransportError::NotConnected);
            }
            inner.pending.insert(
                id.clone(),
                Pending::Publish {
                    payload: payload.clone(),
                    tx,
                },
            );
        }

        let frame = ClientFrame::Publish {
            id: id.clone(),
            channel: channel.to_string(),
            payload,
            store_in_history: true,
        };
        if let Err(e) = self.link.send(frame) {
            self.inner.lock().unwrap().pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            // Pending entry was dropped: the adapter was torn down while
            // the publish was in flight.
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }

    /// Fetch up to `limit` retained messages, oldest to newest. History
    /// failures are non-fatal by contract: every error path degrades to an
    /// empty list.
    pub async fn history(&self, channel: &str, limit: u32) -> Vec<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Vec::new();
            }
            inner.pending.insert(
                id.clone(),
                Pending::History {
                    channel: channel.to_string(),
                    tx,
                },
            );
        }

        let frame = ClientFrame::History {
            id: id.clone(),
            channel: channel.to_string(),
            limit,
        };
        if let Err(e) = self.link.send(frame) {
            self.inner.lock().unwrap().pending.remove(&id);
            warn!(channel, error = %e, "History request failed to send");
            return Vec::new();
        }

        match rx.await {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => {
                warn!(channel, error = %e, "History unavailable");
                Vec::new()
            }
            Err(_) => {
                debug!(channel, "History request dropped during teardown");
                Vec::new()
            }
        }
    }

    /// Latest coarse connection status reflected from the gateway.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch handle for status changes, for front-ends that display it.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Release every channel subscription and fail all in-flight requests.
    /// Safe to call any number of times.
    pub fn cleanup(&self) {
        let (channels, pending) = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            let channels: Vec<String> = inner.subs.drain().map(|(c, _)| c).collect();
            let pending: Vec<Pending> = inner.pending.drain().map(|(_, p)| p).collect();
            (channels, pending)
        };
        for channel in channels {
            let _ = self.link.send(ClientFrame::Unsubscribe { channel });
        }
        // Dropping the pending senders resolves every waiting call with
        // a closed-channel error.
        drop(pending);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }
}

fn dispatch(inner: &Mutex<Inner>, status_tx: &watch::Sender<ConnectionStatus>, frame: ProviderFrame) {
    match frame {
        ProviderFrame::Subscribed { channel } => {
            let mut inner = inner.lock().unwrap();
            match inner.subs.get_mut(&channel) {
                Some(sub) => {
                    sub.state = SubState::Subscribed;
                    debug!(%channel, "Subscription acknowledged");
                }
                None => debug!(%channel, "Ignoring subscribe ack for released channel"),
            }
        }

        ProviderFrame::Message {
            channel,
            timetoken,
            published_at,
            payload,
        } => {
            let handler = inner
                .lock()
                .unwrap()
                .subs
                .get(&channel)
                .map(|sub| (sub.handler.clone(), matches!(sub.state, SubState::Subscribed)));
            match handler {
                Some((handler, acked)) => {
                    if !acked {
                        debug!(%channel, "Delivering message before subscribe ack");
                    }
                    let message = Message::from_wire(&timetoken, &payload, published_at.as_ref());
                    handler(message);
                }
                None => debug!(%channel, "Dropping message for unsubscribed channel"),
            }
        }

        ProviderFrame::PublishAck {
            id,
            timetoken,
            published_at,
        } => {
            let entry = inner.lock().unwrap().pending.remove(&id);
            match entry {
                Some(Pending::Publish { payload, tx }) => {
                    let message = Message::from_wire(&timetoken, &payload, published_at.as_ref());
                    let _ = tx.send(Ok(message));
                }
                Some(other) => {
                    warn!(%id, "Publish ack matched a non-publish request");
                    drop(other);
                }
                None => debug!(%id, "Publish ack for unknown or cancelled request"),
            }
        }

        ProviderFrame::PublishError { id, error } => {
            let entry = inner.lock().unwrap().pending.remove(&id);
            if let Some(Pending::Publish { tx, .. }) = entry {
                let _ = tx.send(Err(TransportError::Rejected(error)));
            }
        }

        ProviderFrame::HistoryResult { id, entries } => {
            let entry = inner.lock().unwrap().pending.remove(&id);
            match entry {
                Some(Pending::History { channel, tx }) => {
                    let mut messages: Vec<Message> = entries
                        .iter()
                        .map(|e| Message::from_wire(&e.timetoken, &e.payload, e.published_at.as_ref()))
                        .collect();
                    messages.sort_by(|a, b| {
                        a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
                    });
                    debug!(%channel, count = messages.len(), "History received");
                    let _ = tx.send(Ok(messages));
                }
                Some(other) => {
                    warn!(%id, "History result matched a non-history request");
                    drop(other);
                }
                None => debug!(%id, "History result for unknown or cancelled request"),
            }
        }

        ProviderFrame::HistoryError { id, error } => {
            let entry = inner.lock().unwrap().pending.remove(&id);
            if let Some(Pending::History { tx, .. }) = entry {
                let _ = tx.send(Err(TransportError::Rejected(error)));
            }
        }

        ProviderFrame::Status { state } => {
            debug!(%state, "Gateway status changed");
            let _ = status_tx.send(state);
        }
    }
}
