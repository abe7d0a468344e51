use chrono::{DateTime, Utc};

use super::ids::{ConversationId, MessageId, ProfileId};

/// Denormalized sender profile joined onto every hydrated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub id: ProfileId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl NewProfile {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar_url(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// Two-party thread. Read only for the sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participant_a: ProfileId,
    pub participant_b: ProfileId,
}

impl ConversationRecord {
    pub fn includes(&self, profile_id: ProfileId) -> bool {
        self.participant_a == profile_id || self.participant_b == profile_id
    }
}

/// Confirmed message row joined with its sender profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ProfileId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    /// Idempotency token supplied by the sending client, echoed back verbatim.
    pub client_token: Option<String>,
    pub sender: ProfileSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: ProfileId,
    pub content: String,
    pub client_token: Option<String>,
}

impl NewMessage {
    pub fn new(
        conversation_id: ConversationId,
        sender_id: ProfileId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: content.into(),
            client_token: None,
        }
    }

    pub fn with_client_token(mut self, client_token: impl Into<String>) -> Self {
        self.client_token = Some(client_token.into());
        self
    }
}

/// Page request for message history. Rows come back newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Exclusive upper bound on `created_at`.
    pub before: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl HistoryQuery {
    pub fn latest(limit: u32) -> Self {
        Self {
            before: None,
            limit,
        }
    }

    pub fn older_than(before: DateTime<Utc>, limit: u32) -> Self {
        Self {
            before: Some(before),
            limit,
        }
    }
}
