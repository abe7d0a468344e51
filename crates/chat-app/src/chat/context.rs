use std::sync::Arc;

use glimpse_storage::{ChatBackend, ConversationId, ConversationRecord, ProfileSnapshot};
use tokio::sync::{Mutex, watch};

use super::history::HistoryLoader;
use super::read_state::ReadStateSynchronizer;
use super::store::MessageStore;

/// Mutable per-session state, guarded by one lock.
#[derive(Debug)]
pub(crate) struct SyncState {
    pub(crate) store: MessageStore,
    pub(crate) history: HistoryLoader,
}

/// Everything the loader, the live subscriber and the send path share.
pub(crate) struct SyncContext {
    pub(crate) backend: Arc<dyn ChatBackend>,
    pub(crate) conversation: ConversationRecord,
    pub(crate) viewer: ProfileSnapshot,
    pub(crate) state: Mutex<SyncState>,
    pub(crate) read_state: ReadStateSynchronizer,
    closed_tx: watch::Sender<bool>,
}

impl SyncContext {
    pub(crate) fn new(
        backend: Arc<dyn ChatBackend>,
        conversation: ConversationRecord,
        viewer: ProfileSnapshot,
        history: HistoryLoader,
        read_state: ReadStateSynchronizer,
    ) -> Self {
        Self {
            backend,
            conversation,
            viewer,
            state: Mutex::new(SyncState {
                store: MessageStore::new(),
                history,
            }),
            read_state,
            closed_tx: watch::channel(false).0,
        }
    }

    pub(crate) fn conversation_id(&self) -> ConversationId {
        self.conversation.id
    }

    pub(crate) fn is_open(&self) -> bool {
        !*self.closed_tx.borrow()
    }

    /// Resolves once the session is closed.
    pub(crate) fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closed_rx = self.closed_tx.subscribe();
        async move {
            let _ = closed_rx.wait_for(|closed| *closed).await;
        }
    }

    /// Results that arrive after this are discarded.
    pub(crate) fn close(&self) {
        if !self.closed_tx.send_replace(true) {
            self.read_state.shutdown();
            tracing::debug!(conversation_id = %self.conversation.id, "conversation session closed");
        }
    }

    /// Requests a read-state update after the message list changed.
    pub(crate) fn after_mutation(&self, store: &MessageStore) {
        if !store.is_empty() {
            self.read_state.request();
        }
    }
}
