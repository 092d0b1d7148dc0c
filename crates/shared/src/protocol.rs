//! Chat wire protocol: inbound normalization, keepalive frames and channel URLs.
//!
//! The backend has shipped several field-naming schemes over time
//! (`user_id`, `userId`, `UserID`, ...) and two role spellings (`bot` and
//! `bot_message`). Inbound frames are therefore read as loose JSON and
//! mapped onto [`ChatMessage`] field by field instead of through a derived
//! `Deserialize`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ChatError;
use crate::models::{ChannelIdentity, ChatMessage, DeliveryState, Metadata, Role};

/// `type` value of the keepalive marker.
pub const KEEPALIVE_TYPE: &str = "ping";

/// Query parameter carrying the actor id.
pub const ACTOR_QUERY_PARAM: &str = "user_id";
/// Query parameter carrying the counterparty id.
pub const COUNTERPARTY_QUERY_PARAM: &str = "customer_id";

const ID_KEYS: &[&str] = &["id", "ID", "Id", "message_id", "messageId", "MessageID"];
const CONTENT_KEYS: &[&str] = &["content", "Content", "text", "Text", "body", "Body"];
const TYPE_KEYS: &[&str] = &[
    "type",
    "Type",
    "role",
    "Role",
    "sender_type",
    "senderType",
    "SenderType",
];
const SENDER_KEYS: &[&str] = &[
    "user_id", "userId", "UserID", "UserId", "sender_id", "senderId", "SenderID",
];
const COUNTERPARTY_KEYS: &[&str] = &[
    "customer_id",
    "customerId",
    "CustomerID",
    "CustomerId",
    "counterparty_id",
    "counterpartyId",
];
const TIMESTAMP_KEYS: &[&str] = &[
    "timestamp",
    "Timestamp",
    "created_at",
    "createdAt",
    "CreatedAt",
];
const CONVERSATION_KEYS: &[&str] = &[
    "conversation_id",
    "conversationId",
    "ConversationID",
    "ConversationId",
];
const METADATA_KEYS: &[&str] = &["metadata", "Metadata", "meta"];
const HISTORY_KEYS: &[&str] = &["history", "History"];

/// Sender ids that identify the backend's bot.
const AUTOMATED_SENDERS: &[&str] = &["bot", "assistant", "ai"];

/// Result of normalizing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Full history replay; replaces whatever the UI currently shows.
    History {
        messages: Vec<ChatMessage>,
        conversation_id: Option<String>,
    },
    /// One new message, appended subject to dedup.
    Single(ChatMessage),
    /// A system frame that only names the conversation.
    Conversation(String),
    /// Keepalive marker or an element with nothing displayable.
    Ignored,
}

/// What a `type`/`role` value says about an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeTag {
    Role(Role),
    Keepalive,
}

fn parse_type_tag(value: &str) -> Option<TypeTag> {
    let value = value.trim().to_ascii_lowercase();
    let base = value.strip_suffix("_message").unwrap_or(&value);
    let tag = match base {
        "user" | "agent" | "actor" => TypeTag::Role(Role::Actor),
        "customer" | "counterparty" => TypeTag::Role(Role::Counterparty),
        "system" => TypeTag::Role(Role::System),
        "bot" | "assistant" => TypeTag::Role(Role::Assistant),
        "ping" | "pong" | "keepalive" | "heartbeat" => TypeTag::Keepalive,
        _ => return None,
    };
    Some(tag)
}

fn is_automated_sender(sender_id: &str) -> bool {
    let sender = sender_id.trim().to_ascii_lowercase();
    AUTOMATED_SENDERS.contains(&sender.as_str())
        || sender.starts_with("bot-")
        || sender.starts_with("bot_")
}

/// First non-blank value under any of `keys`, numbers rendered as strings.
fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_object<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    keys.iter().find_map(|key| map.get(*key)?.as_object())
}

fn first_array<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|key| map.get(*key)?.as_array())
}

/// Deterministic id for a history entry that arrived without one, so that
/// replaying the same history yields the same ids.
fn history_fallback_id(index: usize, role: Role, sender_id: &str, content: &str, raw_ts: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(role.wire_name().as_bytes());
    hasher.update([0]);
    hasher.update(sender_id.as_bytes());
    hasher.update([0]);
    hasher.update(content.as_bytes());
    hasher.update([0]);
    hasher.update(raw_ts.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("history-{}-{}", index, &digest[..12])
}

/// Map one loosely-typed element onto a [`ChatMessage`].
///
/// Returns `None` for keepalive markers and for elements that carry neither
/// content nor a system role, or whose role cannot be determined.
fn normalize_element(
    map: &Map<String, Value>,
    identity: &ChannelIdentity,
    received_at: DateTime<Utc>,
    history_index: Option<usize>,
) -> Option<ChatMessage> {
    let tag = TYPE_KEYS
        .iter()
        .filter_map(|key| map.get(*key)?.as_str())
        .find_map(parse_type_tag);
    let sender = first_string(map, SENDER_KEYS);

    let role = match tag {
        Some(TypeTag::Keepalive) => return None,
        Some(TypeTag::Role(role)) => role,
        None => match sender.as_deref() {
            Some(s) if is_automated_sender(s) => Role::Assistant,
            Some(_) => Role::Actor,
            None => return None,
        },
    };

    let content = first_string(map, CONTENT_KEYS).unwrap_or_default();
    if content.trim().is_empty() && role != Role::System {
        return None;
    }

    let metadata: Metadata = first_object(map, METADATA_KEYS).cloned().unwrap_or_default();
    let conversation_id =
        first_string(map, CONVERSATION_KEYS).or_else(|| first_string(&metadata, CONVERSATION_KEYS));

    let raw_ts = first_string(map, TIMESTAMP_KEYS);
    let timestamp = raw_ts
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(received_at);

    let sender_id = sender.unwrap_or_else(|| match role {
        Role::System => "system".to_string(),
        Role::Assistant => "bot".to_string(),
        Role::Actor | Role::Counterparty => String::new(),
    });

    let id = first_string(map, ID_KEYS).unwrap_or_else(|| match history_index {
        Some(index) => history_fallback_id(
            index,
            role,
            &sender_id,
            &content,
            raw_ts.as_deref().unwrap_or_default(),
        ),
        None => format!("msg-{}", uuid::Uuid::new_v4()),
    });

    Some(ChatMessage {
        id,
        content,
        sender_id,
        counterparty_id: first_string(map, COUNTERPARTY_KEYS)
            .unwrap_or_else(|| identity.counterparty_id.clone()),
        role,
        conversation_id,
        timestamp,
        metadata,
        delivery: DeliveryState::Delivered,
    })
}

fn normalize_history(
    items: &[Value],
    conversation_id: Option<String>,
    identity: &ChannelIdentity,
    received_at: DateTime<Utc>,
) -> Inbound {
    let messages: Vec<ChatMessage> = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            normalize_element(item.as_object()?, identity, received_at, Some(index))
        })
        .collect();
    let conversation_id = conversation_id
        .or_else(|| messages.first().and_then(|m| m.conversation_id.clone()));
    Inbound::History {
        messages,
        conversation_id,
    }
}

/// Normalize one raw text frame from the backend.
///
/// Accepted shapes:
/// - an array of messages (history replay)
/// - `{ "conversation_id": ..., "history": [...] }` (init envelope)
/// - a system message with `metadata.type == "history"` and
///   `metadata.messages` holding the replay
/// - a single message object
///
/// Only unparseable input is an error; unrecognizable elements are dropped.
pub fn normalize(
    raw: &str,
    identity: &ChannelIdentity,
    received_at: DateTime<Utc>,
) -> Result<Inbound, ChatError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ChatError::Malformed(e.to_string()))?;

    let map = match value {
        Value::Array(items) => return Ok(normalize_history(&items, None, identity, received_at)),
        Value::Object(map) => map,
        other => {
            return Err(ChatError::Malformed(format!(
                "expected an object or an array, got {other}"
            )))
        }
    };

    if let Some(items) = first_array(&map, HISTORY_KEYS) {
        let conversation_id = first_string(&map, CONVERSATION_KEYS);
        return Ok(normalize_history(items, conversation_id, identity, received_at));
    }

    let Some(message) = normalize_element(&map, identity, received_at, None) else {
        return Ok(Inbound::Ignored);
    };

    if message.role == Role::System
        && message.metadata.get("type").and_then(Value::as_str) == Some("history")
    {
        if let Some(items) = message.metadata.get("messages").and_then(Value::as_array) {
            return Ok(normalize_history(
                items,
                message.conversation_id.clone(),
                identity,
                received_at,
            ));
        }
    }

    if message.content.trim().is_empty() {
        // A system frame that only carried metadata (e.g. the conversation
        // id) has nothing to display but still teaches us the conversation.
        return Ok(match message.conversation_id {
            Some(conversation_id) => Inbound::Conversation(conversation_id),
            None => Inbound::Ignored,
        });
    }

    Ok(Inbound::Single(message))
}

/// The keepalive frame sent while a connection is open.
pub fn keepalive_frame() -> String {
    serde_json::json!({ "type": KEEPALIVE_TYPE }).to_string()
}

/// Build the channel URL for `identity` from an HTTP(S) base endpoint.
///
/// `http` maps to `ws` and `https` to `wss`; a base that is already a
/// WebSocket URL is used as-is.
pub fn channel_url(base: &str, path: &str, identity: &ChannelIdentity) -> Result<Url, ChatError> {
    let mut url =
        Url::parse(base.trim()).map_err(|e| ChatError::InvalidEndpoint(format!("{base}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChatError::InvalidEndpoint(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::InvalidEndpoint(format!("cannot use scheme '{scheme}'")))?;

    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.query_pairs_mut()
        .clear()
        .append_pair(ACTOR_QUERY_PARAM, &identity.actor_id)
        .append_pair(COUNTERPARTY_QUERY_PARAM, &identity.counterparty_id);

    Ok(url)
}
