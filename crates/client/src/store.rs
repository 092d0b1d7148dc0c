//! Message store for a single chat channel.
//!
//! Single source of truth for what the UI renders. Entries keep arrival
//! order (the UI trusts delivery order over claimed timestamps), ids are
//! unique, and at most one "thinking" placeholder exists at a time.

use supportdesk_shared::ChatMessage;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn pending_placeholders(&self) -> usize {
        self.messages.iter().filter(|m| m.is_placeholder()).count()
    }

    /// Append a message at the end.
    ///
    /// Returns false, leaving the store untouched, if a non-placeholder
    /// message with the same id already exists. Otherwise every pending
    /// placeholder is removed before the message is pushed.
    pub fn append(&mut self, msg: ChatMessage) -> bool {
        if self
            .messages
            .iter()
            .any(|m| m.id == msg.id && !m.is_placeholder())
        {
            return false;
        }

        self.messages.retain(|m| !m.is_placeholder());
        self.messages.push(msg);
        true
    }

    /// Append a locally generated notice ("Connection lost" and friends).
    ///
    /// Only traffic from the backend answers a pending placeholder, so
    /// unlike [`MessageStore::append`] this leaves placeholders in place.
    pub fn append_notice(&mut self, notice: ChatMessage) -> bool {
        if self.contains(&notice.id) {
            return false;
        }
        self.messages.push(notice);
        true
    }

    /// Replace everything with a history replay, placeholders included.
    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) {
        let mut seen = std::collections::HashSet::new();
        self.messages = messages
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use supportdesk_shared::{DeliveryState, Metadata, Role};

    fn message(id: &str, role: Role) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            content: format!("content of {id}"),
            sender_id: "s".to_string(),
            counterparty_id: "c1".to_string(),
            role,
            conversation_id: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            delivery: DeliveryState::Delivered,
        }
    }

    #[test]
    fn test_unique_appends_are_all_kept() {
        let mut store = MessageStore::new();
        for n in 0..50 {
            assert!(store.append(message(&format!("m{n}"), Role::Counterparty)));
        }
        assert_eq!(store.len(), 50);
        assert_eq!(store.messages()[0].id, "m0");
        assert_eq!(store.messages()[49].id, "m49");
    }

    #[test]
    fn test_duplicate_id_is_idempotent() {
        let mut store = MessageStore::new();
        store.append(message("dup1", Role::Assistant));
        let before = store.clone();

        let mut again = message("dup1", Role::Assistant);
        again.content = "different body".to_string();
        assert!(!store.append(again));
        assert_eq!(store, before);
    }

    #[test]
    fn test_arrival_order_beats_timestamps() {
        let mut store = MessageStore::new();
        let mut late = message("late", Role::Counterparty);
        late.timestamp = Utc::now() + chrono::Duration::hours(1);
        store.append(late);
        store.append(message("early", Role::Counterparty));
        assert_eq!(store.messages()[0].id, "late");
    }

    #[test]
    fn test_real_message_clears_placeholder() {
        let mut store = MessageStore::new();
        store.append(message("echo", Role::Actor));
        store.append(ChatMessage::placeholder("c1", None));
        assert_eq!(store.pending_placeholders(), 1);

        store.append(message("r1", Role::Assistant));
        assert_eq!(store.pending_placeholders(), 0);
        assert_eq!(
            store.messages().iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["echo", "r1"]
        );
    }

    #[test]
    fn test_at_most_one_placeholder() {
        let mut store = MessageStore::new();
        store.append(ChatMessage::placeholder("c1", None));
        store.append(ChatMessage::placeholder("c1", None));
        assert_eq!(store.pending_placeholders(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_does_not_clear_placeholder() {
        let mut store = MessageStore::new();
        store.append(message("m1", Role::Counterparty));
        store.append(ChatMessage::placeholder("c1", None));
        assert!(!store.append(message("m1", Role::Counterparty)));
        assert_eq!(store.pending_placeholders(), 1);
    }

    #[test]
    fn test_notice_keeps_placeholder() {
        let mut store = MessageStore::new();
        store.append(message("echo", Role::Actor));
        store.append(ChatMessage::placeholder("c1", None));

        assert!(store.append_notice(ChatMessage::system_notice("Connection lost", "c1")));
        assert_eq!(store.pending_placeholders(), 1);
        assert_eq!(store.len(), 3);

        store.append(message("r1", Role::Assistant));
        assert_eq!(store.pending_placeholders(), 0);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_replace_all_discards_previous_state() {
        let mut store = MessageStore::new();
        store.append(message("old", Role::Actor));
        store.append(ChatMessage::placeholder("c1", None));

        store.replace_all(vec![message("h1", Role::System), message("h2", Role::Assistant)]);
        assert_eq!(
            store.messages().iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["h1", "h2"]
        );
        assert_eq!(store.pending_placeholders(), 0);
    }

    #[test]
    fn test_clear() {
        let mut store = MessageStore::new();
        store.append(message("a", Role::Actor));
        store.clear();
        assert!(store.is_empty());
        assert!(!store.contains("a"));
    }
}
