//! Connection state machine for one chat channel.
//!
//! The machine does no I/O. Every input (identity change, transport event,
//! timer, UI send) is a method call that mutates the machine and returns
//! the [`Effect`]s the driver must carry out: opening or closing transport
//! handles, transmitting frames, arming timers. This keeps all lifecycle
//! rules deterministic and testable without a socket.
//!
//! Each transport handle gets a fresh [`HandleId`]. Events tagged with any
//! handle other than the current one are dropped, so a superseded
//! connection can never drive the state of its successor.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use supportdesk_shared::{
    keepalive_frame, normalize, ChannelIdentity, ChatError, ChatMessage, DeliveryState, Inbound,
    Metadata, OutboundMessage, Role,
};
use url::Url;

use crate::config::ChatConfig;
use crate::store::MessageStore;

pub const CONNECTION_RESTORED: &str = "Connection restored";
pub const CONNECTION_LOST: &str = "Connection lost. Attempting to reconnect...";
pub const RECONNECT_EXHAUSTED: &str =
    "Connection lost. Max reconnect attempts reached. Please refresh the page.";

/// Shortest keepalive period accepted from configuration.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Identifies one transport connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state for a chat channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting { attempt: u32 },
    Open,
    /// A clean close was requested and the close event is pending.
    Closing,
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Automatic reconnection gave up; only a manual connect or a new
    /// identity leaves this state.
    ReconnectExhausted,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting { .. } | ConnectionState::ReconnectScheduled { .. }
        )
    }
}

/// How a transport connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// The transport completed a close handshake it considers intentional.
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: reason.into(),
            was_clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }

    /// Clean closes never trigger reconnection.
    pub fn is_clean(&self) -> bool {
        self.was_clean || self.code == CLOSE_NORMAL
    }
}

/// Something the transport reported about one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    /// Non-fatal; the close event that follows decides recovery.
    Error(String),
    Closed(CloseInfo),
}

/// Work the driver must perform on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport handle.
    Open { handle: HandleId, url: Url },
    /// Write a text frame on an open handle.
    Transmit { handle: HandleId, frame: String },
    /// Request a close but keep listening for the close event.
    Close {
        handle: HandleId,
        code: u16,
        reason: String,
    },
    /// Detach all listeners from the handle, then request a close.
    Quiesce {
        handle: HandleId,
        code: u16,
        reason: String,
    },
    /// Arm the reconnect timer; it reports back with `generation`.
    ScheduleReconnect { generation: u64, delay: Duration },
    CancelReconnect,
    StartKeepalive { interval: Duration },
    StopKeepalive,
}

/// Reconnection bookkeeping for the current identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive failed connections since the last successful open.
    pub attempt: u32,
    /// When this bookkeeping was reset, i.e. when the current identity
    /// was set. Not touched by reconnects.
    pub session_started_at: DateTime<Utc>,
}

impl RetryState {
    fn start() -> Self {
        Self {
            attempt: 0,
            session_started_at: Utc::now(),
        }
    }
}

/// Everything the UI may read about a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSnapshot {
    pub state: ConnectionState,
    pub connected: bool,
    pub last_error: Option<String>,
    pub conversation_id: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            connected: false,
            last_error: None,
            conversation_id: None,
            messages: Vec::new(),
        }
    }
}

pub struct ChannelMachine {
    config: ChatConfig,
    state: ConnectionState,
    identity: Option<ChannelIdentity>,
    current: Option<HandleId>,
    next_handle: u64,
    retry: RetryState,
    reconnect_generation: u64,
    store: MessageStore,
    conversation_id: Option<String>,
    last_error: Option<String>,
    revision: u64,
}

impl ChannelMachine {
    pub fn new(mut config: ChatConfig) -> Self {
        // A zero period would panic the keepalive interval in the driver.
        config.keepalive_interval = config.keepalive_interval.max(MIN_KEEPALIVE_INTERVAL);
        Self {
            config,
            state: ConnectionState::Idle,
            identity: None,
            current: None,
            next_handle: 0,
            retry: RetryState::start(),
            reconnect_generation: 0,
            store: MessageStore::new(),
            conversation_id: None,
            last_error: None,
            revision: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn identity(&self) -> Option<&ChannelIdentity> {
        self.identity.as_ref()
    }

    pub fn current_handle(&self) -> Option<HandleId> {
        self.current
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.store.messages()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Bumped on every change visible through [`ChannelMachine::snapshot`].
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            state: self.state.clone(),
            connected: self.state.is_connected(),
            last_error: self.last_error.clone(),
            conversation_id: self.conversation_id.clone(),
            messages: self.store.messages().to_vec(),
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.touch();
        }
    }

    fn set_error(&mut self, error: Option<String>) {
        if self.last_error != error {
            self.last_error = error;
            self.touch();
        }
    }

    fn push_notice(&mut self, content: &str) {
        let counterparty = self
            .identity
            .as_ref()
            .map(|i| i.counterparty_id.clone())
            .unwrap_or_default();
        if self
            .store
            .append_notice(ChatMessage::system_notice(content, counterparty))
        {
            self.touch();
        }
    }

    /// First write wins for the lifetime of the channel.
    fn learn_conversation(&mut self, conversation_id: Option<String>) {
        if self.conversation_id.is_some() {
            return;
        }
        if let Some(id) = conversation_id.filter(|id| !id.trim().is_empty()) {
            crate::log_info!("Chat conversation id learned: {}", id);
            self.conversation_id = Some(id);
            self.touch();
        }
    }

    /// Switch the channel to a new identity, or to none.
    ///
    /// Any change fully tears down the current channel (timers, handle,
    /// messages, retry state, conversation) before a fresh connection is
    /// opened for the new identity.
    pub fn set_identity(&mut self, identity: Option<ChannelIdentity>) -> Vec<Effect> {
        if self.identity == identity {
            return Vec::new();
        }

        let mut effects = self.reset();
        self.identity = identity;
        if self.identity.is_some() {
            effects.extend(self.begin_connect());
        }
        effects
    }

    /// Explicit teardown, e.g. when the conversation view goes away.
    pub fn teardown(&mut self) -> Vec<Effect> {
        self.set_identity(None)
    }

    fn reset(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelReconnect, Effect::StopKeepalive];
        self.reconnect_generation += 1;
        if let Some(handle) = self.current.take() {
            crate::log_info!("Tearing down chat connection {}", handle);
            effects.push(Effect::Quiesce {
                handle,
                code: CLOSE_NORMAL,
                reason: "Channel closed".to_string(),
            });
        }
        self.state = ConnectionState::Idle;
        self.retry = RetryState::start();
        self.store.clear();
        self.conversation_id = None;
        self.last_error = None;
        self.touch();
        effects
    }

    fn begin_connect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(previous) = self.current.take() {
            effects.push(Effect::Quiesce {
                handle: previous,
                code: CLOSE_NORMAL,
                reason: "Superseded by a new connection".to_string(),
            });
        }

        let Some(identity) = self.identity.as_ref() else {
            self.set_state(ConnectionState::Idle);
            return effects;
        };

        match self.config.channel_url(identity) {
            Ok(url) => {
                self.next_handle += 1;
                let handle = HandleId(self.next_handle);
                crate::log_info!("Connecting chat channel {} to {}", handle, url);
                self.current = Some(handle);
                self.set_state(ConnectionState::Connecting {
                    attempt: self.retry.attempt,
                });
                effects.push(Effect::Open { handle, url });
            }
            Err(e) => {
                crate::log_error!("Cannot build chat channel URL: {}", e);
                self.set_error(Some(e.user_message()));
                self.set_state(ConnectionState::Idle);
            }
        }
        effects
    }

    /// Manually (re)open the channel from `Idle` or `ReconnectExhausted`.
    pub fn connect(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::Idle | ConnectionState::ReconnectExhausted
                if self.identity.is_some() =>
            {
                self.retry.attempt = 0;
                self.begin_connect()
            }
            _ => Vec::new(),
        }
    }

    /// Cleanly close the current connection, keeping identity and messages.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting { .. } => {
                let Some(handle) = self.current else {
                    return Vec::new();
                };
                self.set_state(ConnectionState::Closing);
                vec![
                    Effect::StopKeepalive,
                    Effect::Close {
                        handle,
                        code: CLOSE_NORMAL,
                        reason: "Client disconnect".to_string(),
                    },
                ]
            }
            ConnectionState::ReconnectScheduled { .. } => {
                self.reconnect_generation += 1;
                self.set_state(ConnectionState::Idle);
                vec![Effect::CancelReconnect]
            }
            _ => Vec::new(),
        }
    }

    /// Feed an event reported by the transport for `handle`.
    pub fn on_transport_event(&mut self, handle: HandleId, event: TransportEvent) -> Vec<Effect> {
        if self.current != Some(handle) {
            crate::log_debug!("Ignoring {:?} from stale chat connection {}", event, handle);
            return Vec::new();
        }

        match event {
            TransportEvent::Opened => self.on_open(handle),
            TransportEvent::Frame(text) => {
                self.on_frame(&text);
                Vec::new()
            }
            TransportEvent::Error(detail) => {
                crate::log_warn!("Chat connection {} error: {}", handle, detail);
                self.set_error(Some(ChatError::Transport(detail).user_message()));
                Vec::new()
            }
            TransportEvent::Closed(info) => self.on_close(handle, info),
        }
    }

    fn on_open(&mut self, handle: HandleId) -> Vec<Effect> {
        if !matches!(self.state, ConnectionState::Connecting { .. }) {
            crate::log_debug!("Open event for {} in state {:?}", handle, self.state);
            return Vec::new();
        }

        crate::log_info!("Chat connection {} open", handle);
        let restored = self.retry.attempt > 0;
        self.retry.attempt = 0;
        self.set_state(ConnectionState::Open);
        self.set_error(None);
        if restored {
            self.push_notice(CONNECTION_RESTORED);
        }
        vec![Effect::StartKeepalive {
            interval: self.config.keepalive_interval,
        }]
    }

    fn on_frame(&mut self, text: &str) {
        let Some(identity) = self.identity.as_ref() else {
            return;
        };

        let inbound = match normalize(text, identity, Utc::now()) {
            Ok(inbound) => inbound,
            Err(e) => {
                crate::log_warn!("Dropping chat frame: {}", e);
                crate::log_debug!("Dropped frame payload: {}", text);
                return;
            }
        };

        match inbound {
            Inbound::History {
                messages,
                conversation_id,
            } => {
                crate::log_debug!("Chat history replay with {} messages", messages.len());
                self.learn_conversation(conversation_id);
                self.store.replace_all(messages);
                self.touch();
            }
            Inbound::Single(message) => {
                if message.role == Role::System {
                    self.learn_conversation(message.conversation_id.clone());
                }
                if self.store.append(message) {
                    self.touch();
                }
            }
            Inbound::Conversation(conversation_id) => {
                self.learn_conversation(Some(conversation_id));
            }
            Inbound::Ignored => {}
        }
    }

    fn on_close(&mut self, handle: HandleId, info: CloseInfo) -> Vec<Effect> {
        crate::log_info!(
            "Chat connection {} closed. Code: {}, reason: {:?}, clean: {}",
            handle,
            info.code,
            info.reason,
            info.was_clean
        );
        self.current = None;
        let mut effects = vec![Effect::StopKeepalive];

        if self.state == ConnectionState::Closing || info.is_clean() {
            self.set_state(ConnectionState::Idle);
            return effects;
        }

        let max_attempts = self.config.reconnect.max_attempts;
        let failures = self.retry.attempt.saturating_add(1);
        if failures >= max_attempts {
            crate::log_error!(
                "Chat connection failed {} times in a row, giving up",
                failures
            );
            self.retry.attempt = failures;
            self.set_state(ConnectionState::ReconnectExhausted);
            self.set_error(Some(
                ChatError::ReconnectExhausted { attempts: failures }.user_message(),
            ));
            self.push_notice(RECONNECT_EXHAUSTED);
            return effects;
        }

        let delay = self.config.reconnect.delay_for_attempt(self.retry.attempt);
        self.retry.attempt = failures;
        self.reconnect_generation += 1;
        crate::log_info!(
            "Chat reconnect attempt {}/{} in {}ms",
            failures,
            max_attempts,
            delay.as_millis()
        );

        self.set_error(Some(format!(
            "Connection closed unexpectedly (Code: {}). Attempting to reconnect...",
            info.code
        )));
        self.push_notice(CONNECTION_LOST);
        self.set_state(ConnectionState::ReconnectScheduled {
            attempt: failures,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        effects.push(Effect::ScheduleReconnect {
            generation: self.reconnect_generation,
            delay,
        });
        effects
    }

    /// The reconnect timer armed with `generation` fired.
    pub fn on_reconnect_timer(&mut self, generation: u64) -> Vec<Effect> {
        if generation != self.reconnect_generation
            || !matches!(self.state, ConnectionState::ReconnectScheduled { .. })
        {
            crate::log_debug!("Ignoring superseded reconnect timer {}", generation);
            return Vec::new();
        }
        if self.identity.is_none() {
            self.set_state(ConnectionState::Idle);
            return Vec::new();
        }
        self.begin_connect()
    }

    /// Keepalive interval tick.
    pub fn on_keepalive_tick(&mut self) -> Vec<Effect> {
        match (self.current, &self.state) {
            (Some(handle), ConnectionState::Open) => vec![Effect::Transmit {
                handle,
                frame: keepalive_frame(),
            }],
            _ => Vec::new(),
        }
    }

    /// The driver failed to hand a frame to the transport.
    pub fn on_transmit_failed(&mut self, handle: HandleId, error: &ChatError) {
        if self.current == Some(handle) {
            crate::log_error!("Chat send on {} failed: {}", handle, error);
            self.set_error(Some(
                "Failed to send message. Connection might be down.".to_string(),
            ));
        }
    }

    /// Send an agent message.
    ///
    /// On success the frame is returned as a `Transmit` effect and the store
    /// gains a delivered echo followed by a pending placeholder. When the
    /// connection is not open nothing is queued; the refusal is recorded as
    /// the last error and returned.
    pub fn send(&mut self, content: &str, metadata: Metadata) -> Result<Vec<Effect>, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (Some(identity), Some(handle), ConnectionState::Open) =
            (self.identity.as_ref(), self.current, &self.state)
        else {
            crate::log_warn!("Cannot send chat message, not connected");
            let err = ChatError::NotConnected;
            self.set_error(Some(err.user_message()));
            return Err(err);
        };

        let draft = OutboundMessage::from_actor(
            identity,
            content,
            metadata,
            self.conversation_id.as_deref(),
        );
        let frame = serde_json::to_string(&draft)?;

        let echo = ChatMessage {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            content: draft.content,
            sender_id: draft.user_id,
            counterparty_id: draft.customer_id,
            role: Role::Actor,
            conversation_id: self.conversation_id.clone(),
            timestamp: draft.timestamp,
            metadata: draft.metadata,
            delivery: DeliveryState::Delivered,
        };
        let placeholder = ChatMessage::placeholder(
            identity.counterparty_id.clone(),
            self.conversation_id.clone(),
        );

        self.store.append(echo);
        self.store.append(placeholder);
        self.touch();

        Ok(vec![Effect::Transmit { handle, frame }])
    }
}
