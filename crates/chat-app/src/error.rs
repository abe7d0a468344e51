use glimpse_storage::{ConversationId, ProfileId, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("profile '{viewer}' is not a participant of conversation '{conversation_id}'"))]
    ViewerNotParticipant {
        stage: &'static str,
        viewer: ProfileId,
        conversation_id: ConversationId,
    },
    #[snafu(display("conversation session '{conversation_id}' is closed"))]
    SessionClosed {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("failed to load messages for '{conversation_id}' on `{stage}`: {source}"))]
    LoadFailed {
        stage: &'static str,
        conversation_id: ConversationId,
        source: StorageError,
    },
    #[snafu(display("message content is empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("failed to send message '{optimistic_id}' on `{stage}`: {source}"))]
    SendFailed {
        stage: &'static str,
        optimistic_id: String,
        source: StorageError,
    },
    #[snafu(display("message '{optimistic_id}' is not a failed send and cannot be retried"))]
    NotRetryable {
        stage: &'static str,
        optimistic_id: String,
    },
    #[snafu(display("message '{optimistic_id}' is not a failed send and cannot be discarded"))]
    NotDiscardable {
        stage: &'static str,
        optimistic_id: String,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;
