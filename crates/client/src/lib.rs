//! Supportdesk chat client core.
//!
//! Maintains the realtime chat channel between an agent and a customer:
//! connection lifecycle with bounded exponential reconnect, keepalive,
//! inbound normalization, de-duplicated message store and the optimistic
//! "thinking" placeholder shown while the bot replies.
//!
//! # Architecture
//!
//! ```text
//!   UI ──► ChatChannel (facade) ──commands──► driver task
//!                 ▲                              │
//!                 │ watch<ChatSnapshot>          ├─► ChannelMachine (sans-IO)
//!                 └──────────────────────────────┤      └─► MessageStore
//!                                                └─► Transport (tokio-tungstenite)
//! ```

pub mod backoff;
pub mod channel;
pub mod config;
mod connection;
pub mod logging;
pub mod machine;
pub mod store;
pub mod transport;

pub use backoff::{compute_delay, ReconnectConfig};
pub use channel::{ChannelStatus, ChatChannel};
pub use config::ChatConfig;
pub use machine::{
    ChannelMachine, ChatSnapshot, CloseInfo, ConnectionState, Effect, HandleId, TransportEvent,
};
pub use store::MessageStore;
pub use transport::{EventForwarder, EventSender, Transport, TransportLink, TungsteniteTransport};

pub use supportdesk_shared as shared;
