//! Facade and driver behaviour over an in-memory transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use supportdesk_client::shared::{ChannelIdentity, ChatError, Role};
use supportdesk_client::{
    ChatChannel, ChatConfig, ChatSnapshot, CloseInfo, ConnectionState, EventForwarder,
    EventSender, HandleId, Transport, TransportEvent, TransportLink,
};
use tokio::sync::watch;
use url::Url;

struct LinkRecord {
    handle: HandleId,
    url: Url,
    forwarder: EventForwarder,
    sent: Vec<String>,
    closed: Option<(u16, String)>,
}

#[derive(Clone, Default)]
struct FakeNetwork {
    links: Arc<Mutex<Vec<LinkRecord>>>,
}

impl FakeNetwork {
    fn count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    fn emit(&self, index: usize, event: TransportEvent) {
        let forwarder = self.links.lock().unwrap()[index].forwarder.clone();
        forwarder.emit(event);
    }

    fn sent(&self, index: usize) -> Vec<String> {
        self.links.lock().unwrap()[index].sent.clone()
    }

    fn closed(&self, index: usize) -> Option<(u16, String)> {
        self.links.lock().unwrap()[index].closed.clone()
    }

    fn attached(&self, index: usize) -> bool {
        self.links.lock().unwrap()[index].forwarder.is_attached()
    }

    fn url(&self, index: usize) -> Url {
        self.links.lock().unwrap()[index].url.clone()
    }
}

impl Transport for FakeNetwork {
    fn open(&mut self, handle: HandleId, url: Url, events: EventSender) -> Box<dyn TransportLink> {
        self.links.lock().unwrap().push(LinkRecord {
            handle,
            url,
            forwarder: EventForwarder::new(handle, events),
            sent: Vec::new(),
            closed: None,
        });
        Box::new(FakeLink {
            handle,
            network: self.clone(),
        })
    }
}

struct FakeLink {
    handle: HandleId,
    network: FakeNetwork,
}

impl FakeLink {
    fn with_record<R>(&self, f: impl FnOnce(&mut LinkRecord) -> R) -> R {
        let mut links = self.network.links.lock().unwrap();
        let record = links
            .iter_mut()
            .find(|l| l.handle == self.handle)
            .expect("link record");
        f(record)
    }
}

impl TransportLink for FakeLink {
    fn send_text(&self, frame: String) -> Result<(), ChatError> {
        self.with_record(|r| {
            if r.closed.is_some() {
                return Err(ChatError::Transport("link closed".to_string()));
            }
            r.sent.push(frame);
            Ok(())
        })
    }

    fn close(&self, code: u16, reason: &str) {
        self.with_record(|r| r.closed = Some((code, reason.to_string())));
    }

    fn detach(&self) {
        self.with_record(|r| r.forwarder.detach());
    }
}

fn start() -> (ChatChannel, FakeNetwork, watch::Receiver<ChatSnapshot>) {
    let network = FakeNetwork::default();
    let channel = ChatChannel::spawn_with(ChatConfig::default(), network.clone());
    let updates = channel.subscribe();
    (channel, network, updates)
}

/// Let the driver drain everything that is ready.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn wait_until(
    updates: &mut watch::Receiver<ChatSnapshot>,
    pred: impl FnMut(&ChatSnapshot) -> bool,
) -> ChatSnapshot {
    let snapshot = tokio::time::timeout(Duration::from_secs(5), updates.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("driver stopped");
    snapshot.clone()
}

async fn open(
    channel: &ChatChannel,
    network: &FakeNetwork,
    updates: &mut watch::Receiver<ChatSnapshot>,
) {
    channel.set_identity(Some(ChannelIdentity::new("u1", "c1")));
    settle().await;
    let index = network.count() - 1;
    network.emit(index, TransportEvent::Opened);
    wait_until(updates, |s| s.connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_identity_opens_link() {
    let (channel, network, mut updates) = start();
    open(&channel, &network, &mut updates).await;

    assert_eq!(network.count(), 1);
    assert_eq!(
        network.url(0).as_str(),
        "ws://localhost:8080/chat/ws?user_id=u1&customer_id=c1"
    );
    let status = channel.status();
    assert!(status.connected);
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(channel.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn test_no_identity_no_link() {
    let (channel, network, _updates) = start();
    channel.set_identity(None);
    settle().await;
    assert_eq!(network.count(), 0);
    assert!(!channel.status().connected);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_connecting_reports_error() {
    let (channel, network, mut updates) = start();
    channel.set_identity(Some(ChannelIdentity::new("u1", "c1")));
    settle().await;

    channel.send("hello", None);
    let snapshot = wait_until(&mut updates, |s| s.last_error.is_some()).await;

    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("Cannot send message. Not connected.")
    );
    assert!(snapshot.messages.is_empty());
    assert!(network.sent(0).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_transmits_and_echoes() {
    let (channel, network, mut updates) = start();
    open(&channel, &network, &mut updates).await;

    channel.send("hello", None);
    let snapshot = wait_until(&mut updates, |s| s.messages.len() == 2).await;

    assert_eq!(snapshot.messages[0].content, "hello");
    assert_eq!(snapshot.messages[0].role, Role::Actor);
    assert!(snapshot.messages[1].is_placeholder());

    let sent = network.sent(0);
    assert_eq!(sent.len(), 1);
    let frame: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(frame["content"], "hello");
    assert_eq!(frame["user_id"], "u1");
    assert_eq!(frame["customer_id"], "c1");

    network.emit(
        0,
        TransportEvent::Frame(r#"{"id":"r1","content":"hi","type":"bot"}"#.to_string()),
    );
    let snapshot = wait_until(&mut updates, |s| {
        s.messages.last().is_some_and(|m| m.id == "r1")
    })
    .await;
    assert_eq!(snapshot.messages.len(), 2);
    assert!(!snapshot.messages.iter().any(|m| m.is_placeholder()));
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_backoff() {
    let (channel, network, mut updates) = start();
    open(&channel, &network, &mut updates).await;

    network.emit(0, TransportEvent::Closed(CloseInfo::abnormal("dropped")));
    let snapshot = wait_until(&mut updates, |s| {
        matches!(s.state, ConnectionState::ReconnectScheduled { .. })
    })
    .await;
    assert!(snapshot.last_error.unwrap().contains("1006"));

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(network.count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(network.count(), 2);

    network.emit(1, TransportEvent::Opened);
    let snapshot = wait_until(&mut updates, |s| s.connected).await;
    assert_eq!(snapshot.last_error, None);
    assert_eq!(
        snapshot.messages.last().unwrap().content,
        supportdesk_client::machine::CONNECTION_RESTORED
    );
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_five_attempts() {
    let (channel, network, mut updates) = start();
    channel.set_identity(Some(ChannelIdentity::new("u1", "c1")));
    settle().await;

    for index in 0..5 {
        assert_eq!(network.count(), index + 1);
        network.emit(index, TransportEvent::Closed(CloseInfo::abnormal("refused")));
        // Longest wait is 8s before the fifth attempt.
        tokio::time::sleep(Duration::from_secs(9)).await;
    }

    let snapshot = wait_until(&mut updates, |s| {
        s.state == ConnectionState::ReconnectExhausted
    })
    .await;
    assert_eq!(network.count(), 5);
    assert!(snapshot.last_error.unwrap().contains("refresh"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(network.count(), 5);

    channel.connect();
    settle().await;
    assert_eq!(network.count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_while_open() {
    let (channel, network, mut updates) = start();
    open(&channel, &network, &mut updates).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(network.sent(0), vec![r#"{"type":"ping"}"#.to_string()]);

    channel.disconnect();
    settle().await;
    network.emit(0, TransportEvent::Closed(CloseInfo::normal("bye")));
    wait_until(&mut updates, |s| s.state == ConnectionState::Idle).await;

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(network.sent(0).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_manual_connect() {
    let (channel, network, mut updates) = start();
    open(&channel, &network, &mut updates).await;
    network.emit(
        0,
        TransportEvent::Frame(r#"{"id":"m1","content":"hi","type":"customer"}"#.to_string()),
    );
    wait_until(&mut updates, |s| s.messages.len() == 1).await;

    channel.disconnect();
    settle().await;
    assert_eq!(network.closed(0), Some((1000, "Client disconnect".to_string())));
    assert!(network.attached(0));

    network.emit(0, TransportEvent::Closed(CloseInfo::normal("Client disconnect")));
    let snapshot = wait_until(&mut updates, |s| s.state == ConnectionState::Idle).await;
    assert_eq!(snapshot.messages.len(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(network.count(), 1);

    channel.connect();
    settle().await;
    assert_eq!(network.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_identity_change_quiesces_old_link() {
    let (channel, network, mut updates) = start();
    open(&channel, &network, &mut updates).await;

    channel.set_identity(Some(ChannelIdentity::new("u1", "c2")));
    settle().await;

    assert_eq!(network.count(), 2);
    assert!(!network.attached(0));
    assert_eq!(network.closed(0).map(|(code, _)| code), Some(1000));
    assert!(network.url(1).as_str().ends_with("customer_id=c2"));

    // Nothing from the old link reaches the new channel.
    network.emit(
        0,
        TransportEvent::Frame(r#"{"id":"old","content":"late","type":"customer"}"#.to_string()),
    );
    network.emit(1, TransportEvent::Opened);
    let snapshot = wait_until(&mut updates, |s| s.connected).await;
    assert!(snapshot.messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_driver() {
    let (channel, network, mut updates) = start();
    open(&channel, &network, &mut updates).await;

    channel.shutdown();
    while updates.changed().await.is_ok() {}

    assert!(!network.attached(0));
    assert!(network.closed(0).is_some());
    assert!(!updates.borrow().connected);

    // Commands after shutdown are dropped without panicking.
    channel.send("late", None);
}

#[tokio::test(start_paused = true)]
async fn test_zero_keepalive_does_not_stop_driver() {
    let network = FakeNetwork::default();
    let config = ChatConfig {
        keepalive_interval: Duration::ZERO,
        ..ChatConfig::default()
    };
    let channel = ChatChannel::spawn_with(config, network.clone());
    let mut updates = channel.subscribe();
    open(&channel, &network, &mut updates).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(network.sent(0), vec![r#"{"type":"ping"}"#.to_string()]);

    channel.send("still alive", None);
    wait_until(&mut updates, |s| s.messages.len() == 2).await;
    assert_eq!(network.sent(0).len(), 2);
}
