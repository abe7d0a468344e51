mod context;
/// Timestamp labels, date separators and optimistic id minting.
pub mod format;
pub mod history;
pub mod live;
/// Message identity and delivery state.
pub mod message;
pub mod read_state;
mod send;
pub mod session;
pub mod store;

pub use format::{
    date_separator_text, date_separator_text_local, format_message_time,
    format_message_time_local, generate_optimistic_id, should_show_date_separator,
};
pub use history::{HistoryLoader, INITIAL_LOAD_ERROR, LoadOutcome, OLDER_LOAD_ERROR, SkipReason};
pub use live::{LiveState, LiveSubscriber};
pub use message::{ChatMessage, Delivery, MessageKey, OPTIMISTIC_ID_PREFIX, OptimisticId};
pub use read_state::ReadStateSynchronizer;
pub use session::{ConversationSession, SessionView};
pub use store::{MessageSnapshot, MessageStore};
