//! Error type shared by the normalizer, the connection core and the facade.

use thiserror::Error;

/// Everything that can go wrong on a chat channel.
///
/// None of these cross the facade as a failure: the client core turns them
/// into state transitions and a human-readable `last_error` string (see
/// [`ChatError::user_message`]).
#[derive(Debug, Error)]
pub enum ChatError {
    /// The configured endpoint cannot be turned into a channel URL.
    #[error("invalid channel endpoint: {0}")]
    InvalidEndpoint(String),

    /// An inbound frame could not be parsed.
    #[error("malformed inbound payload: {0}")]
    Malformed(String),

    /// A send was attempted while the connection is not open.
    #[error("cannot send message, not connected")]
    NotConnected,

    /// A send was attempted with blank content.
    #[error("message content is empty")]
    EmptyMessage,

    /// The transport reported a failure (open, read or write).
    #[error("transport error: {0}")]
    Transport(String),

    /// Automatic reconnection gave up.
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("failed to serialize outbound message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The background connection task is gone.
    #[error("chat channel has shut down")]
    ChannelClosed,
}

impl ChatError {
    /// Text suitable for showing to the agent in the UI.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::InvalidEndpoint(detail) => {
                format!("Chat endpoint is misconfigured ({detail}).")
            }
            ChatError::Malformed(_) => "Received an unreadable message from the server.".to_string(),
            ChatError::NotConnected => "Cannot send message. Not connected.".to_string(),
            ChatError::EmptyMessage => "Cannot send an empty message.".to_string(),
            ChatError::Transport(_) => {
                "A WebSocket connection error occurred. Check console/server logs.".to_string()
            }
            ChatError::ReconnectExhausted { .. } => {
                "Failed to connect after multiple attempts. Please refresh the page.".to_string()
            }
            ChatError::Serialize(_) => "Failed to send message. Please try again.".to_string(),
            ChatError::ChannelClosed => "Chat connection has been shut down.".to_string(),
        }
    }
}
