//! Canonical chat data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form message metadata. Values are opaque to the channel.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Content shown by the "thinking" placeholder.
pub const PLACEHOLDER_CONTENT: &str = "...";

/// Who authored a message.
///
/// Serialized with the names the chat backend uses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The local agent driving the UI.
    #[serde(rename = "user")]
    Actor,
    /// The customer on the other end.
    #[serde(rename = "customer")]
    Counterparty,
    #[serde(rename = "system")]
    System,
    /// The backend's bot.
    #[serde(rename = "bot")]
    Assistant,
}

impl Role {
    /// Name used for this role in outbound frames.
    pub fn wire_name(self) -> &'static str {
        match self {
            Role::Actor => "user",
            Role::Counterparty => "customer",
            Role::System => "system",
            Role::Assistant => "bot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Optimistic or placeholder entry, not confirmed by the backend.
    Pending,
    Delivered,
}

/// A message as the UI sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub counterparty_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
    pub delivery: DeliveryState,
}

impl ChatMessage {
    /// A locally generated system notice ("Connection restored" and friends).
    pub fn system_notice(content: impl Into<String>, counterparty_id: impl Into<String>) -> Self {
        Self {
            id: format!("system-{}", uuid::Uuid::new_v4()),
            content: content.into(),
            sender_id: "system".to_string(),
            counterparty_id: counterparty_id.into(),
            role: Role::System,
            conversation_id: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            delivery: DeliveryState::Delivered,
        }
    }

    /// The transient "bot is thinking" entry appended after an optimistic send.
    pub fn placeholder(counterparty_id: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            id: format!("thinking-{}", uuid::Uuid::new_v4()),
            content: PLACEHOLDER_CONTENT.to_string(),
            sender_id: "bot".to_string(),
            counterparty_id: counterparty_id.into(),
            role: Role::Assistant,
            conversation_id,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            delivery: DeliveryState::Pending,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.role == Role::Assistant && self.delivery == DeliveryState::Pending
    }
}

/// The two identifiers a channel is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub actor_id: String,
    pub counterparty_id: String,
}

impl ChannelIdentity {
    pub fn new(actor_id: impl Into<String>, counterparty_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            counterparty_id: counterparty_id.into(),
        }
    }

    /// Build an identity only when both ids are present and non-blank.
    pub fn from_parts(actor_id: Option<&str>, counterparty_id: Option<&str>) -> Option<Self> {
        let actor_id = actor_id.map(str::trim).filter(|s| !s.is_empty())?;
        let counterparty_id = counterparty_id.map(str::trim).filter(|s| !s.is_empty())?;
        Some(Self::new(actor_id, counterparty_id))
    }
}

/// Frame sent to the backend for an agent-authored message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub content: String,
    pub user_id: String,
    pub customer_id: String,
    #[serde(rename = "type")]
    pub role: Role,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Draft an actor message. `conversation_id` is always present in the
    /// metadata, empty until the channel has learned it.
    pub fn from_actor(
        identity: &ChannelIdentity,
        content: impl Into<String>,
        mut metadata: Metadata,
        conversation_id: Option<&str>,
    ) -> Self {
        metadata.insert(
            "conversation_id".to_string(),
            serde_json::Value::String(conversation_id.unwrap_or_default().to_string()),
        );
        Self {
            content: content.into(),
            user_id: identity.actor_id.clone(),
            customer_id: identity.counterparty_id.clone(),
            role: Role::Actor,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_requires_both_ids() {
        assert!(ChannelIdentity::from_parts(Some("u1"), None).is_none());
        assert!(ChannelIdentity::from_parts(Some("  "), Some("c1")).is_none());
        assert_eq!(
            ChannelIdentity::from_parts(Some("u1"), Some(" c1 ")),
            Some(ChannelIdentity::new("u1", "c1"))
        );
    }

    #[test]
    fn test_outbound_wire_shape() {
        let identity = ChannelIdentity::new("u1", "c1");
        let draft = OutboundMessage::from_actor(&identity, "hello", Metadata::new(), None);
        let value = serde_json::to_value(&draft).unwrap();

        assert_eq!(value["content"], json!("hello"));
        assert_eq!(value["user_id"], json!("u1"));
        assert_eq!(value["customer_id"], json!("c1"));
        assert_eq!(value["type"], json!("user"));
        assert_eq!(value["metadata"]["conversation_id"], json!(""));
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_placeholder_is_pending_assistant() {
        let placeholder = ChatMessage::placeholder("c1", None);
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.content, PLACEHOLDER_CONTENT);

        let notice = ChatMessage::system_notice("Connection restored", "c1");
        assert!(!notice.is_placeholder());
        assert_eq!(notice.role, Role::System);
    }
}
