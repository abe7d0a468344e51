//! Boundary schema for rows pushed by the realtime insert feed.
//!
//! Feed payloads are loosely typed JSON. Nothing downstream sees them until
//! [`RawMessageRow::validate`] has turned them into an [`InsertedRow`].

use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::Stream;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use super::error::{DecodeRowSnafu, MalformedRowSnafu, StorageResult};
use super::ids::{ConversationId, MessageId, ProfileId};
use super::types::MessageRecord;

/// Message row exactly as the feed delivers it. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessageRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub client_token: Option<String>,
}

/// Validated, unjoined insert payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ProfileId,
    pub created_at: DateTime<Utc>,
    pub client_token: Option<String>,
}

impl RawMessageRow {
    pub fn from_json(value: serde_json::Value) -> StorageResult<Self> {
        serde_json::from_value(value).context(DecodeRowSnafu {
            stage: "raw-row-decode",
        })
    }

    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            id: Some(record.id.to_string()),
            conversation_id: Some(record.conversation_id.to_string()),
            sender_id: Some(record.sender_id.to_string()),
            content: Some(record.content.clone()),
            created_at: Some(
                record
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            is_read: Some(record.is_read),
            client_token: record.client_token.clone(),
        }
    }

    pub fn validate(self) -> StorageResult<InsertedRow> {
        let id = self.id.context(MalformedRowSnafu {
            stage: "raw-row-id",
            details: "row has no id".to_string(),
        })?;
        let conversation_id = self.conversation_id.context(MalformedRowSnafu {
            stage: "raw-row-conversation-id",
            details: format!("row '{id}' has no conversation_id"),
        })?;
        let sender_id = self.sender_id.context(MalformedRowSnafu {
            stage: "raw-row-sender-id",
            details: format!("row '{id}' has no sender_id"),
        })?;
        let created_at = self.created_at.context(MalformedRowSnafu {
            stage: "raw-row-created-at",
            details: format!("row '{id}' has no created_at"),
        })?;
        if self.content.is_none() {
            return MalformedRowSnafu {
                stage: "raw-row-content",
                details: format!("row '{id}' has no content"),
            }
            .fail();
        }

        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|error| super::error::StorageError::MalformedRow {
                stage: "raw-row-created-at-parse",
                details: format!("row '{id}' has unparseable created_at '{created_at}': {error}"),
            })?
            .with_timezone(&Utc);

        Ok(InsertedRow {
            id: MessageId::parse(&id)?,
            conversation_id: ConversationId::parse(&conversation_id)?,
            sender_id: ProfileId::parse(&sender_id)?,
            created_at,
            client_token: self.client_token,
        })
    }
}

/// Raw insert notification for the `messages` table.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertNotification {
    pub record: serde_json::Value,
}

impl InsertNotification {
    pub fn new(record: serde_json::Value) -> Self {
        Self { record }
    }

    pub fn from_record(record: &MessageRecord) -> Self {
        // Serializing a plain struct of strings and bools cannot fail.
        let value = serde_json::to_value(RawMessageRow::from_record(record))
            .unwrap_or(serde_json::Value::Null);
        Self::new(value)
    }

    /// Conversation the row claims to belong to, without full validation.
    pub fn conversation_hint(&self) -> Option<&str> {
        self.record.get("conversation_id")?.as_str()
    }

    pub fn parse(&self) -> StorageResult<InsertedRow> {
        RawMessageRow::from_json(self.record.clone())?.validate()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Insert(InsertNotification),
    /// The subscriber fell behind and this many notifications were dropped.
    Lagged(u64),
}

/// Live subscription to inserts for one conversation. Dropping it unsubscribes.
pub struct InsertSubscription {
    conversation_id: ConversationId,
    events: BoxStream<'static, FeedEvent>,
}

impl InsertSubscription {
    pub fn new(conversation_id: ConversationId, events: BoxStream<'static, FeedEvent>) -> Self {
        Self {
            conversation_id,
            events,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

impl Stream for InsertSubscription {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::StorageError;

    fn valid_row() -> serde_json::Value {
        json!({
            "id": "0190f5a8-7c1e-7d2a-9f00-000000000001",
            "conversation_id": "0190f5a8-7c1e-7d2a-9f00-0000000000c1",
            "sender_id": "0190f5a8-7c1e-7d2a-9f00-0000000000a1",
            "content": "saw you at the ferry",
            "created_at": "2026-03-01T10:15:00.250Z",
            "is_read": false,
            "client_token": null
        })
    }

    #[test]
    fn valid_payload_parses_into_typed_row() {
        let row = InsertNotification::new(valid_row())
            .parse()
            .expect("payload matches the schema");

        assert_eq!(row.id.to_string(), "0190f5a8-7c1e-7d2a-9f00-000000000001");
        assert_eq!(row.created_at.timestamp_millis(), 1_772_360_100_250);
        assert_eq!(row.client_token, None);
    }

    #[test]
    fn missing_sender_is_rejected_at_the_boundary() {
        let mut payload = valid_row();
        payload
            .as_object_mut()
            .expect("object payload")
            .remove("sender_id");

        let error = InsertNotification::new(payload)
            .parse()
            .expect_err("sender is required");
        assert!(matches!(
            error,
            StorageError::MalformedRow {
                stage: "raw-row-sender-id",
                ..
            }
        ));
    }

    #[test]
    fn wrongly_typed_field_is_a_decode_error() {
        let mut payload = valid_row();
        payload["is_read"] = json!("yes");

        let error = InsertNotification::new(payload)
            .parse()
            .expect_err("is_read must be a bool");
        assert!(matches!(error, StorageError::DecodeRow { .. }));
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let mut payload = valid_row();
        payload["created_at"] = json!("yesterday-ish");

        let error = InsertNotification::new(payload)
            .parse()
            .expect_err("created_at must be RFC 3339");
        assert_eq!(error.stage(), "raw-row-created-at-parse");
    }

    #[test]
    fn conversation_hint_reads_raw_payload() {
        let notification = InsertNotification::new(valid_row());
        assert_eq!(
            notification.conversation_hint(),
            Some("0190f5a8-7c1e-7d2a-9f00-0000000000c1")
        );
    }
}
