use glimpse_storage::{HistoryQuery, MessageRecord, StorageResult};
use snafu::ResultExt;

use super::context::SyncContext;
use super::message::ChatMessage;
use super::store::MessageStore;
use crate::error::{LoadFailedSnafu, SyncResult};

pub const INITIAL_LOAD_ERROR: &str = "Failed to load messages";
pub const OLDER_LOAD_ERROR: &str = "Failed to load older messages";

/// Why a load returned without fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Exhausted,
    EmptyStore,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { fetched: usize, has_more: bool },
    Skipped(SkipReason),
}

/// Pagination state for one conversation.
///
/// One in-flight flag guards both the initial and the older load.
#[derive(Debug, Clone)]
pub struct HistoryLoader {
    page_size: u32,
    has_more: bool,
    in_flight: bool,
    error: Option<String>,
}

impl HistoryLoader {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            has_more: false,
            in_flight: false,
            error: None,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight
    }

    /// Last user-visible load failure, cleared by the next successful load.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn begin_initial(&mut self) -> Result<HistoryQuery, SkipReason> {
        if self.in_flight {
            return Err(SkipReason::InFlight);
        }
        self.in_flight = true;
        Ok(HistoryQuery::latest(self.page_size))
    }

    fn begin_older(&mut self, store: &MessageStore) -> Result<HistoryQuery, SkipReason> {
        if self.in_flight {
            return Err(SkipReason::InFlight);
        }
        if !self.has_more {
            return Err(SkipReason::Exhausted);
        }
        let Some(cursor) = store.oldest_cursor() else {
            return Err(SkipReason::EmptyStore);
        };
        self.in_flight = true;
        Ok(HistoryQuery::older_than(cursor, self.page_size))
    }

    /// A full page implies more may exist; a false positive costs one empty fetch.
    fn finish(&mut self, fetched: usize) -> bool {
        self.in_flight = false;
        self.error = None;
        self.has_more = fetched == self.page_size as usize;
        self.has_more
    }

    fn fail(&mut self, message: &str) {
        self.in_flight = false;
        self.error = Some(message.to_string());
    }

    fn abandon(&mut self) {
        self.in_flight = false;
    }
}

pub(crate) async fn load_initial(context: &SyncContext) -> SyncResult<LoadOutcome> {
    let query = {
        let mut state = context.state.lock().await;
        if !context.is_open() {
            return Ok(LoadOutcome::Skipped(SkipReason::Closed));
        }
        match state.history.begin_initial() {
            Ok(query) => query,
            Err(reason) => return Ok(LoadOutcome::Skipped(reason)),
        }
    };

    let result = context
        .backend
        .query_messages(context.conversation_id(), query)
        .await;

    apply_page(context, result, PageKind::Initial).await
}

pub(crate) async fn load_older(context: &SyncContext) -> SyncResult<LoadOutcome> {
    let query = {
        let mut state = context.state.lock().await;
        if !context.is_open() {
            return Ok(LoadOutcome::Skipped(SkipReason::Closed));
        }
        let state = &mut *state;
        match state.history.begin_older(&state.store) {
            Ok(query) => query,
            Err(reason) => return Ok(LoadOutcome::Skipped(reason)),
        }
    };

    let result = context
        .backend
        .query_messages(context.conversation_id(), query)
        .await;

    apply_page(context, result, PageKind::Older).await
}

#[derive(Debug, Clone, Copy)]
enum PageKind {
    Initial,
    Older,
}

impl PageKind {
    fn stage(self) -> &'static str {
        match self {
            Self::Initial => "history-load-initial",
            Self::Older => "history-load-older",
        }
    }

    fn user_error(self) -> &'static str {
        match self {
            Self::Initial => INITIAL_LOAD_ERROR,
            Self::Older => OLDER_LOAD_ERROR,
        }
    }
}

async fn apply_page(
    context: &SyncContext,
    result: StorageResult<Vec<MessageRecord>>,
    kind: PageKind,
) -> SyncResult<LoadOutcome> {
    let conversation_id = context.conversation_id();
    let mut state = context.state.lock().await;

    if !context.is_open() {
        state.history.abandon();
        tracing::debug!(
            conversation_id = %conversation_id,
            stage = kind.stage(),
            "discarding page that completed after close"
        );
        return Ok(LoadOutcome::Skipped(SkipReason::Closed));
    }

    let rows = match result {
        Ok(rows) => rows,
        Err(error) => {
            state.history.fail(kind.user_error());
            tracing::warn!(
                conversation_id = %conversation_id,
                stage = kind.stage(),
                error = %error,
                "history fetch failed"
            );
            return Err(error).context(LoadFailedSnafu {
                stage: kind.stage(),
                conversation_id,
            });
        }
    };

    let fetched = rows.len();
    let has_more = state.history.finish(fetched);
    // Storage pages are newest first.
    let messages = rows
        .into_iter()
        .rev()
        .filter(|row| {
            let belongs = row.conversation_id == conversation_id;
            if !belongs {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    message_id = %row.id,
                    "dropping row from another conversation"
                );
            }
            belongs
        })
        .map(ChatMessage::from)
        .collect::<Vec<_>>();

    match kind {
        PageKind::Initial => state.store.replace_all(messages),
        PageKind::Older => {
            let added = state.store.prepend(messages);
            tracing::debug!(conversation_id = %conversation_id, fetched, added, "prepended older page");
        }
    }
    context.after_mutation(&state.store);

    Ok(LoadOutcome::Loaded { fetched, has_more })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_load_needs_a_cursor_and_more_pages() {
        let store = MessageStore::new();
        let mut loader = HistoryLoader::new(20);

        assert_eq!(loader.begin_older(&store), Err(SkipReason::Exhausted));
        loader.has_more = true;
        assert_eq!(loader.begin_older(&store), Err(SkipReason::EmptyStore));
        assert!(!loader.is_loading());
    }

    #[test]
    fn one_flag_guards_both_loads() {
        let mut loader = HistoryLoader::new(20);
        assert_eq!(loader.begin_initial(), Ok(HistoryQuery::latest(20)));
        assert_eq!(loader.begin_initial(), Err(SkipReason::InFlight));

        loader.has_more = true;
        assert_eq!(
            loader.begin_older(&MessageStore::new()),
            Err(SkipReason::InFlight)
        );
    }

    #[test]
    fn full_page_heuristic_and_error_clearing() {
        let mut loader = HistoryLoader::new(3);
        loader.in_flight = true;
        loader.fail(INITIAL_LOAD_ERROR);
        assert_eq!(loader.error(), Some(INITIAL_LOAD_ERROR));
        assert!(!loader.is_loading());

        assert!(loader.finish(3));
        assert_eq!(loader.error(), None);
        assert!(!loader.finish(2));
    }

    #[test]
    fn page_size_is_at_least_one() {
        assert_eq!(HistoryLoader::new(0).page_size(), 1);
    }
}
