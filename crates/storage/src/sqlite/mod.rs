use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageResult,
};
use super::ids::{ConversationId, MessageId, ProfileId};
use super::schema::{FeedEvent, InsertNotification, InsertSubscription};
use super::types::{
    ConversationRecord, HistoryQuery, MessageRecord, NewMessage, NewProfile, ProfileSnapshot,
};
use super::{BoxFuture, InsertFeed, MessageSink, MessageSource, ReadReceiptSink};

/// Notifications buffered per subscriber before it is reported as lagged.
pub const INSERT_FEED_CAPACITY: usize = 256;

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.created_at, m.is_read, m.client_token, p.display_name, p.avatar_url FROM messages m JOIN profiles p ON p.id = m.sender_id";

#[derive(Debug, Clone)]
pub struct SqliteChatStore {
    pool: SqlitePool,
    database_url: String,
    inserts: broadcast::Sender<InsertNotification>,
}

impl SqliteChatStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let (inserts, _) = broadcast::channel(INSERT_FEED_CAPACITY);
        tracing::info!(database_url = %database_url, "opened sqlite chat store");

        Ok(Self {
            pool,
            database_url,
            inserts,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub async fn create_profile(&self, input: NewProfile) -> StorageResult<ProfileSnapshot> {
        let profile_id = ProfileId::new_v7();
        sqlx::query(
            "INSERT INTO profiles (id, display_name, avatar_url, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(profile_id.to_string())
        .bind(input.display_name.clone())
        .bind(input.avatar_url.clone())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "profile-create-insert",
        })?;

        Ok(ProfileSnapshot {
            id: profile_id,
            display_name: input.display_name,
            avatar_url: input.avatar_url,
        })
    }

    pub async fn create_conversation(
        &self,
        participant_a: ProfileId,
        participant_b: ProfileId,
    ) -> StorageResult<ConversationRecord> {
        if participant_a == participant_b {
            return ConflictSnafu {
                stage: "conversation-create-same-participant",
                entity: "conversation",
                details: format!("profile '{participant_a}' cannot message itself"),
            }
            .fail();
        }

        let conversation_id = ConversationId::new_v7();
        sqlx::query(
            "INSERT INTO conversations (id, participant_a, participant_b, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(participant_a.to_string())
        .bind(participant_b.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-create-insert",
        })?;

        Ok(ConversationRecord {
            id: conversation_id,
            participant_a,
            participant_b,
        })
    }

    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
            stage: "conversation-get-acquire",
        })?;
        load_conversation(&mut connection, conversation_id, "conversation-get-query").await
    }

    async fn load_joined(
        connection: &mut SqliteConnection,
        message_id: MessageId,
        stage: &'static str,
    ) -> StorageResult<Option<MessageRecord>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!("{MESSAGE_SELECT} WHERE m.id = ?"))
            .bind(message_id.to_string())
            .fetch_optional(&mut *connection)
            .await
            .context(SqliteQuerySnafu { stage })?;

        row.map(message_row_to_record).transpose()
    }
}

impl MessageSource for SqliteChatStore {
    fn query_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            if query.limit == 0 {
                return Ok(Vec::new());
            }

            let before = query.before.map(|before| before.timestamp_millis());
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "{MESSAGE_SELECT} WHERE m.conversation_id = ? AND (? IS NULL OR m.created_at < ?) ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
            ))
            .bind(conversation_id.to_string())
            .bind(before)
            .bind(before)
            .bind(i64::from(query.limit))
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-page-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn fetch_message_by_id<'a>(
        &'a self,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-fetch-acquire",
            })?;
            Self::load_joined(&mut connection, message_id, "message-fetch-query").await
        })
    }
}

impl MessageSink for SqliteChatStore {
    fn insert_message<'a>(
        &'a self,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-insert-begin",
            })?;

            let conversation = load_conversation(
                &mut tx,
                input.conversation_id,
                "message-insert-load-conversation",
            )
            .await?
            .context(NotFoundSnafu {
                stage: "message-insert-conversation-missing",
                entity: "conversation",
                id: input.conversation_id.to_string(),
            })?;

            if !conversation.includes(input.sender_id) {
                return ConflictSnafu {
                    stage: "message-insert-sender-scope",
                    entity: "message",
                    details: format!(
                        "profile '{}' is not a participant of conversation '{}'",
                        input.sender_id, input.conversation_id
                    ),
                }
                .fail();
            }

            // A retried send carries the same token; hand back the row the first attempt wrote.
            if let Some(client_token) = input.client_token.as_deref() {
                let existing = sqlx::query_scalar::<_, String>(
                    "SELECT id FROM messages WHERE conversation_id = ? AND client_token = ?",
                )
                .bind(input.conversation_id.to_string())
                .bind(client_token)
                .fetch_optional(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-insert-token-lookup",
                })?;

                if let Some(existing) = existing {
                    let existing_id = MessageId::parse(&existing)?;
                    let record = Self::load_joined(
                        &mut tx,
                        existing_id,
                        "message-insert-load-existing",
                    )
                    .await?
                    .context(InvariantViolationSnafu {
                        stage: "message-insert-existing-vanished",
                        details: format!("message '{existing_id}' disappeared inside a transaction"),
                    })?;
                    tx.commit().await.context(SqliteQuerySnafu {
                        stage: "message-insert-commit-existing",
                    })?;
                    tracing::debug!(
                        message_id = %record.id,
                        client_token,
                        "insert matched an existing client token"
                    );
                    return Ok(record);
                }
            }

            let message_id = MessageId::new_v7();
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at, is_read, client_token) VALUES (?, ?, ?, ?, ?, 0, ?)",
            )
            .bind(message_id.to_string())
            .bind(input.conversation_id.to_string())
            .bind(input.sender_id.to_string())
            .bind(input.content)
            .bind(Utc::now().timestamp_millis())
            .bind(input.client_token)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-insert-row",
            })?;

            let record = Self::load_joined(&mut tx, message_id, "message-insert-load-new")
                .await?
                .context(InvariantViolationSnafu {
                    stage: "message-insert-new-vanished",
                    details: format!("message '{message_id}' missing right after insert"),
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-insert-commit",
            })?;

            // Having no live subscribers is not an error.
            let _ = self.inserts.send(InsertNotification::from_record(&record));
            Ok(record)
        })
    }
}

impl ReadReceiptSink for SqliteChatStore {
    fn update_read_state<'a>(
        &'a self,
        conversation_id: ConversationId,
        reader_id: ProfileId,
    ) -> BoxFuture<'a, StorageResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE messages SET is_read = 1 WHERE conversation_id = ? AND sender_id <> ? AND is_read = 0",
            )
            .bind(conversation_id.to_string())
            .bind(reader_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "read-state-update",
            })?;

            Ok(result.rows_affected())
        })
    }
}

impl InsertFeed for SqliteChatStore {
    fn subscribe_inserts<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<InsertSubscription>> {
        Box::pin(async move {
            let receiver = self.inserts.subscribe();
            let wanted = conversation_id.to_string();

            // Server-side filter equivalent: only rows whose conversation_id matches are delivered.
            let events = futures::stream::unfold(
                (receiver, wanted),
                |(mut receiver, wanted)| async move {
                    loop {
                        match receiver.recv().await {
                            Ok(notification) => {
                                if notification.conversation_hint() == Some(wanted.as_str()) {
                                    return Some((
                                        FeedEvent::Insert(notification),
                                        (receiver, wanted),
                                    ));
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                return Some((FeedEvent::Lagged(skipped), (receiver, wanted)));
                            }
                            Err(RecvError::Closed) => return None,
                        }
                    }
                },
            )
            .boxed();

            Ok(InsertSubscription::new(conversation_id, events))
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    participant_a: String,
    participant_b: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    content: String,
    created_at: i64,
    is_read: bool,
    client_token: Option<String>,
    display_name: String,
    avatar_url: Option<String>,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        participant_a: ProfileId::parse(&row.participant_a)?,
        participant_b: ProfileId::parse(&row.participant_b)?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let sender_id = ProfileId::parse(&row.sender_id)?;
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        sender_id,
        content: row.content,
        created_at: millis_to_datetime(row.created_at, "message-row-created-at")?,
        is_read: row.is_read,
        client_token: row.client_token,
        sender: ProfileSnapshot {
            id: sender_id,
            display_name: row.display_name,
            avatar_url: row.avatar_url,
        },
    })
}

async fn load_conversation(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    stage: &'static str,
) -> StorageResult<Option<ConversationRecord>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, participant_a, participant_b FROM conversations WHERE id = ?",
    )
    .bind(conversation_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    row.map(conversation_row_to_record).transpose()
}

fn millis_to_datetime(value: i64, stage: &'static str) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value).context(InvariantViolationSnafu {
        stage,
        details: format!("sqlite timestamp '{value}' is out of range"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_location_maps_to_sqlite_memory_url() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(
            normalize_database_url("/tmp/glimpse/chat.db"),
            "sqlite:///tmp/glimpse/chat.db"
        );
    }

    #[test]
    fn out_of_range_timestamp_is_an_invariant_violation() {
        let error = millis_to_datetime(i64::MAX, "test-stage").expect_err("out of range");
        assert_eq!(error.stage(), "test-stage");
    }
}
