use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use glimpse_storage::{ChatBackend, ConversationId, ProfileId};
use tokio::sync::watch;

/// Marks other participants' messages as read on behalf of the viewer.
///
/// Updates are best effort: failures are logged and dropped, never retried.
#[derive(Clone)]
pub struct ReadStateSynchronizer {
    inner: Arc<ReadStateInner>,
}

struct ReadStateInner {
    backend: Arc<dyn ChatBackend>,
    conversation_id: ConversationId,
    reader_id: ProfileId,
    debounce: Duration,
    scheduled: AtomicBool,
    issued: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl ReadStateSynchronizer {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        conversation_id: ConversationId,
        reader_id: ProfileId,
        debounce: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReadStateInner {
                backend,
                conversation_id,
                reader_id,
                debounce,
                scheduled: AtomicBool::new(false),
                issued: AtomicU64::new(0),
                shutdown_tx,
            }),
        }
    }

    /// Number of update calls issued so far, successful or not.
    pub fn issued(&self) -> u64 {
        self.inner.issued.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !*self.inner.shutdown_tx.borrow()
    }

    /// Issues the update now and swallows any failure.
    pub async fn mark_conversation_read(&self) {
        let inner = &self.inner;
        inner.issued.fetch_add(1, Ordering::AcqRel);

        match inner
            .backend
            .update_read_state(inner.conversation_id, inner.reader_id)
            .await
        {
            Ok(updated) => {
                tracing::trace!(
                    conversation_id = %inner.conversation_id,
                    updated,
                    "marked conversation read"
                );
            }
            Err(error) => {
                tracing::debug!(
                    conversation_id = %inner.conversation_id,
                    stage = error.stage(),
                    error = %error,
                    "read-state update failed; ignoring"
                );
            }
        }
    }

    /// Issues the update in the background, skipping the debounce window.
    pub fn request_now(&self) {
        if !self.is_running() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.mark_conversation_read().await });
    }

    /// Schedules an update in the background.
    ///
    /// Requests inside one debounce window coalesce. A request made after the
    /// window closed schedules a fresh update, so rows that arrived while an
    /// update was running are covered by the next one.
    pub fn request(&self) {
        if !self.is_running() {
            return;
        }

        if self.inner.debounce.is_zero() {
            self.request_now();
            return;
        }

        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(this.inner.debounce) => {}
                _ = shutdown_rx.changed() => {
                    this.inner.scheduled.store(false, Ordering::Release);
                    return;
                }
            }

            this.inner.scheduled.store(false, Ordering::Release);
            if this.is_running() {
                this.mark_conversation_read().await;
            }
        });
    }

    /// Drops any scheduled update and ignores later requests.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}
