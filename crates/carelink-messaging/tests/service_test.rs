//! End-to-end tests for the messaging service against a scripted fake
//! gateway wired over channels, the same seam the WebSocket link uses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use carelink_core::{ClientFrame, HistoryEntry, ProviderFrame, WirePayload};
use carelink_messaging::{MessagingError, MessagingEvent, MessagingService, Topology};
use carelink_store::{Contact, MemoryStore};
use carelink_transport::{Link, Transport, TransportError};

struct ChannelLink(mpsc::UnboundedSender<ClientFrame>);

impl Link for ChannelLink {
    fn send(&self, frame: ClientFrame) -> carelink_transport::Result<()> {
        self.0.send(frame).map_err(|_| TransportError::ChannelClosed)
    }
}

#[derive(Default, Clone)]
struct GatewayScript {
    history: Arc<Mutex<HashMap<String, Vec<HistoryEntry>>>>,
    reject_publish: Arc<Mutex<bool>>,
    swallow_publish: Arc<Mutex<bool>>,
}

impl GatewayScript {
    fn set_history(&self, channel: &str, entries: Vec<HistoryEntry>) {
        self.history.lock().unwrap().insert(channel.to_string(), entries);
    }
}

/// Spin up a transport whose link talks to a scripted responder task.
/// Returns the transport and the intake sender for pushing live frames.
fn spawn_gateway(script: GatewayScript) -> (Arc<Transport>, mpsc::UnboundedSender<ProviderFrame>) {
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let (intake_tx, intake_rx) = mpsc::unbounded_channel::<ProviderFrame>();
    let transport = Arc::new(Transport::new(Box::new(ChannelLink(frame_tx)), intake_rx));

    let responder = intake_tx.clone();
    tokio::spawn(async move {
        let mut next_token: u64 = 1000;
        while let Some(frame) = frame_rx.recv().await {
            match frame {
                ClientFrame::Subscribe { channel } => {
                    let _ = responder.send(ProviderFrame::Subscribed { channel });
                }
                ClientFrame::Unsubscribe { .. } => {}
                ClientFrame::Publish { id, .. } => {
                    if *script.swallow_publish.lock().unwrap() {
                        continue;
                    }
                    if *script.reject_publish.lock().unwrap() {
                        let _ = responder.send(ProviderFrame::PublishError {
                            id,
                            error: "invalid publish key".into(),
                        });
                    } else {
                        next_token += 1;
                        let _ = responder.send(ProviderFrame::PublishAck {
                            id,
                            timetoken: next_token.to_string(),
                            published_at: Some(json!(1_700_000_500)),
                        });
                    }
                }
                ClientFrame::History { id, channel, .. } => {
                    let entries = script
                        .history
                        .lock()
                        .unwrap()
                        .get(&channel)
                        .cloned()
                        .unwrap_or_default();
                    let _ = responder.send(ProviderFrame::HistoryResult { id, entries });
                }
            }
        }
    });

    (transport, intake_tx)
}

fn wire(sender_id: &str, receiver_id: &str, text: &str) -> WirePayload {
    WirePayload {
        sender: Some(format!("user-{sender_id}")),
        text: Some(text.to_string()),
        sender_id: Some(sender_id.to_string()),
        receiver_id: Some(receiver_id.to_string()),
        sender_name: Some(format!("user-{sender_id}")),
        receiver_name: None,
        timestamp: None,
    }
}

fn live(
    channel: &str,
    timetoken: &str,
    sender_id: &str,
    receiver_id: &str,
    text: &str,
    ts_secs: i64,
) -> ProviderFrame {
    ProviderFrame::Message {
        channel: channel.to_string(),
        timetoken: timetoken.to_string(),
        published_at: Some(json!(ts_secs)),
        payload: wire(sender_id, receiver_id, text),
    }
}

fn entry(timetoken: &str, sender_id: &str, receiver_id: &str, text: &str, ts_secs: i64) -> HistoryEntry {
    HistoryEntry {
        timetoken: timetoken.to_string(),
        published_at: Some(json!(ts_secs)),
        payload: wire(sender_id, receiver_id, text),
    }
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<MessagingEvent>,
    pred: impl Fn(&MessagingEvent) -> bool,
) -> MessagingEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn shared_service(
    transport: Arc<Transport>,
    kv: Arc<MemoryStore>,
) -> MessagingService {
    MessagingService::new(
        transport,
        kv,
        "7",
        "Me",
        Topology::Shared { channel: "global_messages".into() },
    )
}

#[tokio::test]
async fn test_live_messages_derive_contacts_end_to_end() {
    let (transport, intake) = spawn_gateway(GatewayScript::default());
    let mut service = shared_service(transport, Arc::new(MemoryStore::new()));
    let mut events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::Ready)).await;

    intake
        .send(live("global_messages", "1", "42", "7", "hi", 1_700_000_000))
        .unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::MessageReceived { .. })).await;

    let contacts = service.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, "42");
    assert_eq!(contacts[0].last_message, "hi");
    assert_eq!(contacts[0].last_message_time, 1_700_000_000_000);

    intake
        .send(live("global_messages", "2", "42", "7", "again", 1_700_000_100))
        .unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::MessageReceived { .. })).await;

    let contacts = service.contacts();
    assert_eq!(contacts.len(), 1, "second message must not duplicate the contact");
    assert_eq!(contacts[0].last_message, "again");
    assert_eq!(contacts[0].last_message_time, 1_700_000_100_000);
}

#[tokio::test]
async fn test_history_and_live_converge_deduplicated() {
    let script = GatewayScript::default();
    script.set_history(
        "global_messages",
        vec![
            entry("2", "7", "42", "reply", 1_700_000_050),
            entry("1", "42", "7", "first", 1_700_000_000),
            // Traffic for an unrelated pair on the shared channel.
            entry("9", "8", "9", "not ours", 1_700_000_010),
        ],
    );
    let (transport, intake) = spawn_gateway(script);
    let mut service = shared_service(transport, Arc::new(MemoryStore::new()));
    let mut events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::Ready)).await;

    // Live delivery overlapping with history, plus one genuinely new.
    intake
        .send(live("global_messages", "2", "7", "42", "reply", 1_700_000_050))
        .unwrap();
    intake
        .send(live("global_messages", "3", "42", "7", "newest", 1_700_000_100))
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, MessagingEvent::MessageReceived { message, .. } if message.id == "3")
    })
    .await;

    let messages = service.messages_with("42");
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["1", "2", "3"]);
    assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    // The unrelated pair never becomes a contact.
    let contacts = service.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, "42");
}

#[tokio::test]
async fn test_failed_publish_leaves_stores_untouched() {
    let script = GatewayScript::default();
    *script.reject_publish.lock().unwrap() = true;
    let (transport, _intake) = spawn_gateway(script);
    let mut service = shared_service(transport, Arc::new(MemoryStore::new()));
    let _events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();

    let result = service.send_to("42", "hello").await;
    match result {
        Err(MessagingError::Transport(TransportError::Rejected(reason))) => {
            assert!(reason.contains("publish key"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    assert!(service.messages_with("42").is_empty());
    assert!(service.contacts().is_empty());
}

#[tokio::test]
async fn test_publish_echo_is_not_duplicated() {
    let (transport, intake) = spawn_gateway(GatewayScript::default());
    let mut service = shared_service(transport, Arc::new(MemoryStore::new()));
    let mut events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::Ready)).await;

    let sent = service.send_to("42", "hello").await.unwrap();
    assert_eq!(sent.sender_id, "7");
    assert_eq!(sent.receiver_id, "42");

    // Shared channels echo the publisher's own message back.
    intake
        .send(ProviderFrame::Message {
            channel: "global_messages".into(),
            timetoken: sent.id.clone(),
            published_at: Some(json!(1_700_000_500)),
            payload: wire("7", "42", "hello"),
        })
        .unwrap();
    // A later unrelated message proves the echo was processed and skipped.
    intake
        .send(live("global_messages", "9999", "42", "7", "marker", 1_700_000_600))
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, MessagingEvent::MessageReceived { message, .. } if message.id == "9999")
    })
    .await;

    let copies = service
        .messages_with("42")
        .iter()
        .filter(|m| m.id == sent.id)
        .count();
    assert_eq!(copies, 1);
}

#[tokio::test]
async fn test_rehydrated_contacts_available_before_traffic() {
    let kv = Arc::new(MemoryStore::new());
    {
        let mut seeded = Contact::new("42", "Maria Rossi");
        seeded.last_message = "see you tomorrow".into();
        seeded.last_message_time = 1_699_000_000_000;
        let raw = serde_json::to_string(&vec![seeded]).unwrap();
        use carelink_store::KvStore;
        kv.set("contacts_7", &raw).unwrap();
    }

    let (transport, _intake) = spawn_gateway(GatewayScript::default());
    let mut service = shared_service(transport, kv);
    let _events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();

    let contacts = service.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].name, "Maria Rossi");
    assert_eq!(contacts[0].last_message, "see you tomorrow");
}

#[tokio::test]
async fn test_periodic_refresh_picks_up_new_history() {
    let script = GatewayScript::default();
    let (transport, _intake) = spawn_gateway(script.clone());
    let mut service = shared_service(transport, Arc::new(MemoryStore::new()))
        .with_refresh_interval(Duration::from_millis(50));
    let mut events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::Ready)).await;
    assert!(service.contacts().is_empty());

    // History appears on the gateway after startup; only the timer can
    // bring it in.
    script.set_history(
        "global_messages",
        vec![entry("1", "42", "7", "hello from history", 1_700_000_000)],
    );

    wait_for(&mut events, |e| matches!(e, MessagingEvent::HistoryLoaded { .. })).await;
    let contacts = service.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].last_message, "hello from history");

    service.stop();
}

#[tokio::test]
async fn test_stop_discards_inflight_publish() {
    let script = GatewayScript::default();
    *script.swallow_publish.lock().unwrap() = true;
    let (transport, _intake) = spawn_gateway(script);
    let mut service = shared_service(transport, Arc::new(MemoryStore::new()));
    let _events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();

    let service = Arc::new(service);
    let inflight = {
        let service = service.clone();
        tokio::spawn(async move { service.send_to("42", "doomed").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    service.stop();
    service.stop();

    let result = inflight.await.unwrap();
    assert!(matches!(
        result,
        Err(MessagingError::Transport(TransportError::ChannelClosed))
    ));
    assert!(service.messages_with("42").is_empty());
}

#[tokio::test]
async fn test_direct_topology_uses_pair_channels() {
    let script = GatewayScript::default();
    script.set_history(
        "dm_7_42",
        vec![entry("1", "42", "7", "from history", 1_700_000_000)],
    );
    let (transport, intake) = spawn_gateway(script);
    let mut service = MessagingService::new(
        transport,
        Arc::new(MemoryStore::new()),
        "7",
        "Me",
        Topology::Direct,
    );
    let mut events = service.take_event_receiver().unwrap();
    service.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::Ready)).await;

    service.add_contact(Contact::new("42", "Dr. Rossi")).unwrap();
    service.refresh().await;
    assert_eq!(service.messages_with("42").len(), 1);

    intake
        .send(live("dm_7_42", "2", "42", "7", "live one", 1_700_000_100))
        .unwrap();
    wait_for(&mut events, |e| matches!(e, MessagingEvent::MessageReceived { .. })).await;

    let messages = service.messages_with("42");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text, "from history");
    assert_eq!(messages[1].text, "live one");

    let contacts = service.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].name, "Dr. Rossi");
    assert_eq!(contacts[0].last_message, "live one");
}
