use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::message::{ChatMessage, Delivery, MessageKey, OptimisticId};

/// Immutable ordered view handed to the UI after every mutation.
pub type MessageSnapshot = Arc<[ChatMessage]>;

/// In-memory message list for one conversation.
///
/// Keys are unique at all times and entries are ordered by `created_at`,
/// ties kept in arrival order.
#[derive(Debug)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    keys: HashSet<MessageKey>,
    snapshot_tx: watch::Sender<MessageSnapshot>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(MessageSnapshot::from(Vec::new()));
        Self {
            messages: Vec::new(),
            keys: HashSet::new(),
            snapshot_tx,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.keys.contains(key)
    }

    pub fn snapshot(&self) -> MessageSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MessageSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Pagination cursor: `created_at` of the oldest server-confirmed entry.
    pub fn oldest_cursor(&self) -> Option<DateTime<Utc>> {
        self.messages
            .iter()
            .find(|message| !message.key.is_optimistic())
            .map(|message| message.created_at)
    }

    pub fn find_optimistic(&self, optimistic_id: &OptimisticId) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .find(|message| message.optimistic_id() == Some(optimistic_id))
    }

    /// Replaces the list with a freshly loaded page.
    ///
    /// Local entries that are still sending or failed survive unless the page
    /// already contains their confirmed row. Confirmed entries missing from the
    /// page survive when they are not older than its newest row: they arrived
    /// after the page was read. With an empty page every confirmed entry survives.
    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) {
        let previous = std::mem::take(&mut self.messages);
        self.keys.clear();

        let local_tokens = previous
            .iter()
            .filter_map(|message| message.optimistic_id().cloned())
            .collect::<HashSet<_>>();
        let sent_keys = previous
            .iter()
            .filter(|message| message.delivery == Delivery::Sent)
            .map(|message| message.key.clone())
            .collect::<HashSet<_>>();

        for mut message in messages {
            let replaces_local = message
                .client_token
                .as_ref()
                .is_some_and(|token| local_tokens.contains(token));
            if message.delivery == Delivery::Confirmed
                && (replaces_local || sent_keys.contains(&message.key))
            {
                message.delivery = Delivery::Sent;
            }
            if self.keys.insert(message.key.clone()) {
                self.messages.push(message);
            }
        }

        let confirmed_tokens = self
            .messages
            .iter()
            .filter_map(|message| message.client_token.clone())
            .collect::<HashSet<_>>();
        let newest = self.messages.iter().map(|message| message.created_at).max();
        for message in previous {
            if self.keys.contains(&message.key) {
                continue;
            }
            let survives = match message.optimistic_id() {
                Some(id) => !confirmed_tokens.contains(id),
                None => newest.is_none_or(|newest| message.created_at >= newest),
            };
            if survives {
                self.keys.insert(message.key.clone());
                self.messages.push(message);
            }
        }

        self.messages.sort_by_key(|message| message.created_at);
        self.publish();
    }

    /// Adds an older page in front of the current list. Returns how many entries were added.
    pub fn prepend(&mut self, messages: Vec<ChatMessage>) -> usize {
        let mut incoming = Vec::with_capacity(messages.len());
        for message in messages {
            if self.supersede_pending(&message) {
                continue;
            }
            if self.keys.insert(message.key.clone()) {
                incoming.push(message);
            }
        }

        let added = incoming.len();
        if added > 0 {
            incoming.append(&mut self.messages);
            incoming.sort_by_key(|message| message.created_at);
            self.messages = incoming;
        }
        self.publish();
        added
    }

    /// Inserts one message at its chronological position.
    ///
    /// Returns `false` when the key is already present, or when a local entry's
    /// token is already confirmed. A confirmed message whose client token
    /// matches a local entry replaces that entry.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if self.keys.contains(&message.key) {
            return false;
        }
        if message
            .optimistic_id()
            .is_some_and(|token| self.is_confirmed(token))
        {
            return false;
        }

        if !self.supersede_pending(&message) {
            self.keys.insert(message.key.clone());
            self.insert_ordered(message);
        }
        self.publish();
        true
    }

    pub fn mark_failed(&mut self, optimistic_id: &OptimisticId, reason: impl Into<String>) -> bool {
        self.set_delivery(optimistic_id, Delivery::Failed(reason.into()))
    }

    /// Moves a failed entry back to sending and returns a copy of it.
    pub fn mark_sending(&mut self, optimistic_id: &OptimisticId) -> Option<ChatMessage> {
        let message = self
            .messages
            .iter_mut()
            .find(|message| message.optimistic_id() == Some(optimistic_id))?;
        if !message.is_failed() {
            return None;
        }

        message.delivery = Delivery::Sending;
        let copy = message.clone();
        self.publish();
        Some(copy)
    }

    /// Removes a failed local entry. Confirmed and in-flight entries are never removed.
    pub fn remove_failed(&mut self, optimistic_id: &OptimisticId) -> bool {
        let Some(index) = self.messages.iter().position(|message| {
            message.optimistic_id() == Some(optimistic_id) && message.is_failed()
        }) else {
            return false;
        };

        let removed = self.messages.remove(index);
        self.keys.remove(&removed.key);
        self.publish();
        true
    }

    fn is_confirmed(&self, token: &OptimisticId) -> bool {
        self.messages.iter().any(|message| {
            !message.key.is_optimistic() && message.client_token.as_ref() == Some(token)
        })
    }

    fn set_delivery(&mut self, optimistic_id: &OptimisticId, delivery: Delivery) -> bool {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.optimistic_id() == Some(optimistic_id))
        else {
            return false;
        };

        message.delivery = delivery;
        self.publish();
        true
    }

    fn supersede_pending(&mut self, confirmed: &ChatMessage) -> bool {
        if confirmed.key.is_optimistic() {
            return false;
        }
        let Some(token) = confirmed.client_token.as_ref() else {
            return false;
        };
        let Some(index) = self
            .messages
            .iter()
            .position(|message| message.optimistic_id() == Some(token))
        else {
            return false;
        };

        let pending = self.messages.remove(index);
        self.keys.remove(&pending.key);

        let mut replacement = confirmed.clone();
        if replacement.delivery == Delivery::Confirmed {
            replacement.delivery = Delivery::Sent;
        }
        if self.keys.insert(replacement.key.clone()) {
            self.insert_ordered(replacement);
        }
        true
    }

    fn insert_ordered(&mut self, message: ChatMessage) {
        let index = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.messages.insert(index, message);
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(MessageSnapshot::from(self.messages.clone()));
    }
}
