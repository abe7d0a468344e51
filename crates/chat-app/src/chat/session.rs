use std::sync::Arc;

use glimpse_storage::{ChatBackend, ConversationId, ConversationRecord, ProfileSnapshot};
use snafu::ensure;
use tokio::sync::watch;

use super::context::SyncContext;
use super::history::{self, HistoryLoader, LoadOutcome};
use super::live::{LiveState, LiveSubscriber};
use super::message::{ChatMessage, OptimisticId};
use super::read_state::ReadStateSynchronizer;
use super::send;
use super::store::MessageSnapshot;
use crate::error::{SessionClosedSnafu, SyncResult, ViewerNotParticipantSnafu};
use crate::settings::SyncSettings;

/// Everything a message list needs to render one frame.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub conversation_id: ConversationId,
    pub messages: MessageSnapshot,
    pub has_more: bool,
    pub is_loading: bool,
    pub error: Option<String>,
    pub live: LiveState,
}

/// Synchronization state for one conversation as seen by one viewer.
///
/// Switching conversation or viewer means closing this session and opening a
/// new one. Closing, or dropping, cancels the live worker and the pending
/// read-state update; fetches that complete afterwards are discarded.
pub struct ConversationSession {
    context: Arc<SyncContext>,
    live: LiveSubscriber,
}

impl ConversationSession {
    /// Starts the live subscription. Must be called from within a Tokio runtime.
    pub fn open(
        backend: Arc<dyn ChatBackend>,
        conversation: ConversationRecord,
        viewer: ProfileSnapshot,
        settings: &SyncSettings,
    ) -> SyncResult<Self> {
        ensure!(
            conversation.includes(viewer.id),
            ViewerNotParticipantSnafu {
                stage: "session-open",
                viewer: viewer.id,
                conversation_id: conversation.id,
            }
        );

        let settings = settings.clone().normalized();
        let read_state = ReadStateSynchronizer::new(
            Arc::clone(&backend),
            conversation.id,
            viewer.id,
            settings.read_state_debounce(),
        );
        let context = Arc::new(SyncContext::new(
            backend,
            conversation,
            viewer,
            HistoryLoader::new(settings.page_size),
            read_state,
        ));
        let live = LiveSubscriber::start(Arc::clone(&context));

        tracing::info!(
            conversation_id = %context.conversation_id(),
            viewer = %context.viewer.id,
            page_size = settings.page_size,
            "opened conversation session"
        );
        Ok(Self { context, live })
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.context.conversation_id()
    }

    pub fn viewer(&self) -> &ProfileSnapshot {
        &self.context.viewer
    }

    pub fn is_open(&self) -> bool {
        self.context.is_open()
    }

    pub async fn load_initial(&self) -> SyncResult<LoadOutcome> {
        history::load_initial(&self.context).await
    }

    pub async fn load_older(&self) -> SyncResult<LoadOutcome> {
        history::load_older(&self.context).await
    }

    pub async fn send(&self, content: &str) -> SyncResult<ChatMessage> {
        send::send(&self.context, content).await
    }

    pub async fn retry(&self, optimistic_id: &OptimisticId) -> SyncResult<ChatMessage> {
        send::retry(&self.context, optimistic_id).await
    }

    pub async fn discard(&self, optimistic_id: &OptimisticId) -> SyncResult<()> {
        send::discard(&self.context, optimistic_id).await
    }

    /// Issues a read-state update right away, bypassing the debounce.
    pub async fn mark_read(&self) {
        if self.context.is_open() {
            self.context.read_state.mark_conversation_read().await;
        }
    }

    pub fn read_state(&self) -> &ReadStateSynchronizer {
        &self.context.read_state
    }

    pub async fn view(&self) -> SessionView {
        let state = self.context.state.lock().await;
        SessionView {
            conversation_id: self.context.conversation_id(),
            messages: state.store.snapshot(),
            has_more: state.history.has_more(),
            is_loading: state.history.is_loading(),
            error: state.history.error().map(str::to_string),
            live: self.live.state(),
        }
    }

    /// Receives a fresh snapshot after every store mutation.
    pub async fn subscribe(&self) -> watch::Receiver<MessageSnapshot> {
        self.context.state.lock().await.store.subscribe()
    }

    pub fn live_state(&self) -> LiveState {
        self.live.state()
    }

    pub fn watch_live_state(&self) -> watch::Receiver<LiveState> {
        self.live.watch_state()
    }

    /// Replaces the live subscription and reloads the newest page.
    pub async fn reconnect(&mut self) -> SyncResult<LoadOutcome> {
        ensure!(
            self.context.is_open(),
            SessionClosedSnafu {
                stage: "session-reconnect",
                conversation_id: self.context.conversation_id(),
            }
        );

        tracing::info!(conversation_id = %self.context.conversation_id(), "reconnecting live feed");
        self.live.restart(Arc::clone(&self.context));
        self.load_initial().await
    }

    /// Stops the live worker and the pending read-state update.
    pub fn close(&self) {
        self.context.close();
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.context.close();
    }
}
