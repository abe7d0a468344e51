use std::fmt;

use chrono::{DateTime, Utc};
use glimpse_storage::{ConversationId, MessageId, MessageRecord, ProfileId, ProfileSnapshot};

/// Prefix shared by every locally generated message id.
pub const OPTIMISTIC_ID_PREFIX: &str = "optimistic-";

/// Temporary id of a message that has not been confirmed by the server.
///
/// Doubles as the idempotency token sent with the insert, so the confirmed row
/// echoes it back in `client_token`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptimisticId(String);

impl OptimisticId {
    /// Accepts only text carrying the optimistic prefix.
    pub fn parse(raw: &str) -> Option<Self> {
        let suffix = raw.strip_prefix(OPTIMISTIC_ID_PREFIX)?;
        if suffix.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub(crate) fn from_parts(epoch_millis: i64, random_suffix: &str) -> Self {
        Self(format!("{OPTIMISTIC_ID_PREFIX}{epoch_millis}-{random_suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OptimisticId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Identity of one entry in a conversation's message list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Optimistic(OptimisticId),
}

impl MessageKey {
    pub fn is_optimistic(&self) -> bool {
        matches!(self, Self::Optimistic(_))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(formatter, "{id}"),
            Self::Optimistic(id) => write!(formatter, "{id}"),
        }
    }
}

/// Delivery lifecycle of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Row read from storage or from the live feed.
    Confirmed,
    /// Local entry waiting for the insert to be acknowledged.
    Sending,
    /// Server row that replaced a local entry sent from this session.
    Sent,
    /// Insert failed; the entry can be retried or discarded.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: ProfileId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub client_token: Option<OptimisticId>,
    pub sender: ProfileSnapshot,
    pub delivery: Delivery,
}

impl ChatMessage {
    /// Creates the local entry shown while an insert is in flight.
    pub fn pending(
        optimistic_id: OptimisticId,
        conversation_id: ConversationId,
        sender: ProfileSnapshot,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: MessageKey::Optimistic(optimistic_id.clone()),
            conversation_id,
            sender_id: sender.id,
            content: content.into(),
            created_at,
            is_read: false,
            client_token: Some(optimistic_id),
            sender,
            delivery: Delivery::Sending,
        }
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match &self.key {
            MessageKey::Server(id) => Some(*id),
            MessageKey::Optimistic(_) => None,
        }
    }

    pub fn optimistic_id(&self) -> Option<&OptimisticId> {
        match &self.key {
            MessageKey::Optimistic(id) => Some(id),
            MessageKey::Server(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Sending | Delivery::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed(_))
    }

    pub fn is_from(&self, profile_id: ProfileId) -> bool {
        self.sender_id == profile_id
    }
}

impl From<MessageRecord> for ChatMessage {
    fn from(record: MessageRecord) -> Self {
        Self {
            key: MessageKey::Server(record.id),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content,
            created_at: record.created_at,
            is_read: record.is_read,
            // Tokens minted by other clients are not ours to reconcile against.
            client_token: record.client_token.as_deref().and_then(OptimisticId::parse),
            sender: record.sender,
            delivery: Delivery::Confirmed,
        }
    }
}
