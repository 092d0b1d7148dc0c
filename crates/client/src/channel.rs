//! Public facade the UI talks to.
//!
//! A [`ChatChannel`] is the only thing a conversation view holds. It hides
//! the state machine, the transport and the reconnect loop behind a small
//! contract: read the status, read the last error, send, and subscribe to
//! snapshot changes. Nothing here returns a transport failure; problems
//! surface as `last_error` in the snapshot.
//!
//! ```rust,ignore
//! let channel = ChatChannel::spawn(ChatConfig::from_env());
//! channel.set_identity(ChannelIdentity::from_parts(Some(&agent_id), Some(&customer_id)));
//!
//! let mut updates = channel.subscribe();
//! while updates.changed().await.is_ok() {
//!     render(&updates.borrow());
//! }
//! ```

use serde::Serialize;
use supportdesk_shared::{ChannelIdentity, ChatError, ChatMessage, Metadata};
use tokio::sync::{mpsc, watch};

use crate::config::ChatConfig;
use crate::connection::{spawn_driver, Command};
use crate::machine::{ChannelMachine, ChatSnapshot, ConnectionState};
use crate::transport::{Transport, TungsteniteTransport};

/// What the UI shows in its connection indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub connected: bool,
    pub state: ConnectionState,
}

/// Handle to a running chat channel. Cheap to clone; the channel is torn
/// down when the last clone is dropped or [`ChatChannel::shutdown`] is called.
#[derive(Clone)]
pub struct ChatChannel {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ChatSnapshot>,
}

impl ChatChannel {
    /// Start a channel over real WebSockets. Must be called inside a tokio runtime.
    pub fn spawn(config: ChatConfig) -> Self {
        Self::spawn_with(config, TungsteniteTransport)
    }

    /// Start a channel over a custom transport.
    pub fn spawn_with<T: Transport>(config: ChatConfig, transport: T) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(ChatSnapshot::default());
        spawn_driver(ChannelMachine::new(config), transport, receiver, snapshot_tx);
        Self {
            commands,
            snapshots,
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            crate::log_warn!("{}, command dropped", ChatError::ChannelClosed);
        }
    }

    /// Point the channel at a new (actor, counterparty) pair, or at none.
    /// A change tears down the current connection and clears the messages.
    pub fn set_identity(&self, identity: Option<ChannelIdentity>) {
        self.command(Command::SetIdentity(identity));
    }

    /// Send an agent message. Fire-and-forget: if the channel is not open
    /// the message is dropped and `last_error` says so.
    pub fn send(&self, content: impl Into<String>, metadata: Option<Metadata>) {
        self.command(Command::Send {
            content: content.into(),
            metadata: metadata.unwrap_or_default(),
        });
    }

    /// Reopen after a clean disconnect or after reconnection gave up.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Cleanly close the connection, keeping the messages on screen.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Tear the channel down and stop the background task.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    pub fn status(&self) -> ChannelStatus {
        let snapshot = self.snapshots.borrow();
        ChannelStatus {
            connected: snapshot.connected,
            state: snapshot.state.clone(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.snapshots.borrow().last_error.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.snapshots.borrow().messages.clone()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that wakes on every visible change.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.clone()
    }
}
