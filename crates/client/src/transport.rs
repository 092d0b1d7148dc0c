//! Transport seam between the connection driver and the network.
//!
//! A [`Transport`] opens one link per [`HandleId`] and reports everything
//! that happens on it as [`TransportEvent`]s tagged with that handle. The
//! native implementation uses tokio-tungstenite; tests plug in an
//! in-memory fake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use supportdesk_shared::ChatError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::machine::{CloseInfo, HandleId, TransportEvent};

/// Where links deliver their events.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<(HandleId, TransportEvent)>;

/// Opens links. Must not block: connecting happens in the background and
/// is reported through `events`.
pub trait Transport: Send + 'static {
    fn open(&mut self, handle: HandleId, url: Url, events: EventSender) -> Box<dyn TransportLink>;
}

/// One open (or opening) connection.
pub trait TransportLink: Send {
    /// Queue a text frame for writing.
    fn send_text(&self, frame: String) -> Result<(), ChatError>;

    /// Request a close handshake.
    fn close(&self, code: u16, reason: &str);

    /// Stop delivering events for this link. Irreversible.
    fn detach(&self);
}

/// Forwards link events to the driver until detached.
#[derive(Clone)]
pub struct EventForwarder {
    handle: HandleId,
    events: EventSender,
    attached: Arc<AtomicBool>,
}

impl EventForwarder {
    pub fn new(handle: HandleId, events: EventSender) -> Self {
        Self {
            handle,
            events,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.attached.load(Ordering::Acquire) {
            let _ = self.events.send((self.handle, event));
        }
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

const LOG_SCOPE: &str = "supportdesk_client::transport";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn open(&mut self, handle: HandleId, url: Url, events: EventSender) -> Box<dyn TransportLink> {
        let (outgoing, receiver) = unbounded();
        let forwarder = EventForwarder::new(handle, events);
        tokio::spawn(run_link(url, receiver, forwarder.clone()));
        Box::new(TungsteniteLink {
            outgoing,
            forwarder,
        })
    }
}

struct TungsteniteLink {
    outgoing: UnboundedSender<Outgoing>,
    forwarder: EventForwarder,
}

impl TransportLink for TungsteniteLink {
    fn send_text(&self, frame: String) -> Result<(), ChatError> {
        self.outgoing
            .unbounded_send(Outgoing::Text(frame))
            .map_err(|e| ChatError::Transport(format!("Failed to send: {}", e)))
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.outgoing.unbounded_send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn detach(&self) {
        self.forwarder.detach();
    }
}

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Close code for a close frame that carried no status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Translate a close frame the peer sent. The peer finished the close
/// handshake, so the close is clean whatever its code; a server refusing
/// the channel (e.g. 1008) must not be retried.
fn close_info_from(frame: Option<CloseFrame>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_string(),
            was_clean: true,
        },
        None => CloseInfo {
            code: CLOSE_NO_STATUS,
            reason: String::new(),
            was_clean: true,
        },
    }
}

/// Drive one WebSocket connection until it closes.
async fn run_link(url: Url, mut outgoing: UnboundedReceiver<Outgoing>, forwarder: EventForwarder) {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            crate::log_error!(target: LOG_SCOPE, "WebSocket connect to {} failed: {}", url, e);
            forwarder.emit(TransportEvent::Error(e.to_string()));
            forwarder.emit(TransportEvent::Closed(CloseInfo::abnormal(e.to_string())));
            return;
        }
        Err(_) => {
            crate::log_error!(target: LOG_SCOPE, "WebSocket connect to {} timed out", url);
            forwarder.emit(TransportEvent::Error("Connection timeout".to_string()));
            forwarder.emit(TransportEvent::Closed(CloseInfo::abnormal("Connection timeout")));
            return;
        }
    };

    forwarder.emit(TransportEvent::Opened);
    let (mut write, mut read) = stream.split();

    let close = loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    forwarder.emit(TransportEvent::Frame(text.as_str().to_string()));
                }
                Some(Ok(Message::Close(frame))) => break close_info_from(frame),
                Some(Ok(Message::Binary(data))) => {
                    crate::log_warn!(target: LOG_SCOPE, "Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite itself.
                }
                Some(Err(e)) => {
                    crate::log_error!(target: LOG_SCOPE, "WebSocket read error: {}", e);
                    forwarder.emit(TransportEvent::Error(e.to_string()));
                    break CloseInfo::abnormal(e.to_string());
                }
                None => break CloseInfo::abnormal("Stream ended without a close frame"),
            },
            command = outgoing.next() => match command {
                Some(Outgoing::Text(frame)) => {
                    if let Err(e) = write.send(Message::text(frame)).await {
                        crate::log_error!(target: LOG_SCOPE, "Send failed: {}", e);
                        forwarder.emit(TransportEvent::Error(e.to_string()));
                        break CloseInfo::abnormal(e.to_string());
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    if write.send(Message::Close(Some(frame))).await.is_err() {
                        break CloseInfo::abnormal(reason);
                    }
                    break await_close_reply(&mut read, code, reason).await;
                }
                None => {
                    // Link dropped without an explicit close.
                    let _ = write.send(Message::Close(None)).await;
                    break CloseInfo::normal("Link dropped");
                }
            },
        }
    };

    forwarder.emit(TransportEvent::Closed(close));
}

/// After sending our close frame, wait for the peer to answer.
async fn await_close_reply(read: &mut WsRead, code: u16, reason: String) -> CloseInfo {
    let reply = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(message) = read.next().await {
            if let Ok(Message::Close(_)) = message {
                return true;
            }
            if message.is_err() {
                return false;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    CloseInfo {
        code,
        reason,
        was_clean: reply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_info_from_frames() {
        let normal = close_info_from(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".to_string().into(),
        }));
        assert_eq!(normal.code, 1000);
        assert!(normal.is_clean());

        let away = close_info_from(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".to_string().into(),
        }));
        assert_eq!(away.code, 1001);
        assert!(away.is_clean());

        let none = close_info_from(None);
        assert_eq!(none.code, 1005);
        assert!(none.is_clean());
    }

    #[test]
    fn test_policy_close_from_server_is_clean() {
        let refused = close_info_from(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "unauthorized".to_string().into(),
        }));
        assert_eq!(refused.code, 1008);
        assert_eq!(refused.reason, "unauthorized");
        assert!(refused.is_clean());
    }

    #[tokio::test]
    async fn test_forwarder_stops_after_detach() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = crate::machine::HandleId::from_raw(7);
        let forwarder = EventForwarder::new(handle, tx);

        forwarder.emit(TransportEvent::Opened);
        forwarder.detach();
        forwarder.emit(TransportEvent::Frame("late".to_string()));
        drop(forwarder);

        assert_eq!(rx.recv().await, Some((handle, TransportEvent::Opened)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_unclean_close() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = crate::machine::HandleId::from_raw(1);
        // Port 9 on localhost is almost never listening; connect fails fast.
        let url = Url::parse("ws://127.0.0.1:9/chat/ws").unwrap();
        let _link = TungsteniteTransport.open(handle, url, tx);

        let mut saw_error = false;
        while let Some((h, event)) = rx.recv().await {
            assert_eq!(h, handle);
            match event {
                TransportEvent::Error(_) => saw_error = true,
                TransportEvent::Closed(info) => {
                    assert!(!info.is_clean());
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_error);
    }
}
