use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId, ProfileId};
pub use schema::{FeedEvent, InsertNotification, InsertSubscription, InsertedRow, RawMessageRow};
pub use sqlite::SqliteChatStore;
pub use types::{
    ConversationRecord, HistoryQuery, MessageRecord, NewMessage, NewProfile, ProfileSnapshot,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait MessageSource: Send + Sync {
    /// Returns at most `query.limit` rows, newest first.
    fn query_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;

    fn fetch_message_by_id<'a>(
        &'a self,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>>;
}

pub trait MessageSink: Send + Sync {
    /// Inserting the same `(conversation, client_token)` twice yields the first row.
    fn insert_message<'a>(&'a self, input: NewMessage)
    -> BoxFuture<'a, StorageResult<MessageRecord>>;
}

pub trait ReadReceiptSink: Send + Sync {
    /// Marks every unread message not sent by `reader_id` as read. Returns rows touched.
    fn update_read_state<'a>(
        &'a self,
        conversation_id: ConversationId,
        reader_id: ProfileId,
    ) -> BoxFuture<'a, StorageResult<u64>>;
}

pub trait InsertFeed: Send + Sync {
    fn subscribe_inserts<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<InsertSubscription>>;
}

pub trait ChatBackend: MessageSource + MessageSink + ReadReceiptSink + InsertFeed {}

impl<T> ChatBackend for T where T: MessageSource + MessageSink + ReadReceiptSink + InsertFeed {}
