use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use glimpse_storage::{FeedEvent, InsertNotification, InsertSubscription, MessageId, MessageRecord};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::context::SyncContext;
use super::message::ChatMessage;

/// Connection state of the live insert feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Disconnected,
    Subscribing,
    Active,
}

impl LiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for LiveState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

struct LiveShared {
    state_tx: watch::Sender<LiveState>,
    epoch: AtomicU64,
}

impl LiveShared {
    /// Only the most recently started worker may publish.
    fn publish(&self, epoch: u64, state: LiveState) {
        if self.epoch.load(Ordering::Acquire) == epoch {
            self.state_tx.send_replace(state);
        }
    }
}

/// Owns the worker that forwards other participants' inserts into the store.
///
/// Dropping the subscriber cancels the worker, which drops the subscription.
pub struct LiveSubscriber {
    shared: Arc<LiveShared>,
    cancel_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSubscriber {
    /// Spawns the worker. Must be called from within a Tokio runtime.
    pub(crate) fn start(context: Arc<SyncContext>) -> Self {
        let (state_tx, _) = watch::channel(LiveState::Disconnected);
        let mut subscriber = Self {
            shared: Arc::new(LiveShared {
                state_tx,
                epoch: AtomicU64::new(0),
            }),
            cancel_tx: None,
            worker: None,
        };
        subscriber.restart(context);
        subscriber
    }

    /// Tears the current subscription down and opens a fresh one.
    pub(crate) fn restart(&mut self, context: Arc<SyncContext>) {
        self.stop();

        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.shared.publish(epoch, LiveState::Subscribing);
        self.cancel_tx = Some(cancel_tx);
        self.worker = Some(tokio::spawn(run_worker(
            context,
            Arc::clone(&self.shared),
            epoch,
            cancel_rx,
        )));
    }

    pub fn state(&self) -> LiveState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    pub fn watch_state(&self) -> watch::Receiver<LiveState> {
        self.shared.state_tx.subscribe()
    }

    /// Returns `true` when a running worker was asked to stop.
    pub(crate) fn stop(&mut self) -> bool {
        let cancelled = self
            .cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);
        self.worker = None;
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.state_tx.send_replace(LiveState::Disconnected);
        cancelled
    }
}

impl Drop for LiveSubscriber {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

async fn run_worker(
    context: Arc<SyncContext>,
    shared: Arc<LiveShared>,
    epoch: u64,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let conversation_id = context.conversation_id();
    let closed = context.closed();
    tokio::pin!(closed);

    let mut subscription: InsertSubscription = tokio::select! {
        _ = &mut cancel_rx => return,
        _ = &mut closed => {
            shared.publish(epoch, LiveState::Disconnected);
            return;
        }
        result = context.backend.subscribe_inserts(conversation_id) => match result {
            Ok(subscription) => subscription,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage = error.stage(),
                    error = %error,
                    "failed to subscribe to inserts"
                );
                shared.publish(epoch, LiveState::Disconnected);
                return;
            }
        },
    };

    shared.publish(epoch, LiveState::Active);
    tracing::debug!(conversation_id = %conversation_id, "live subscription active");

    loop {
        let event = tokio::select! {
            _ = &mut cancel_rx => return,
            _ = &mut closed => {
                shared.publish(epoch, LiveState::Disconnected);
                return;
            }
            event = subscription.next() => event,
        };

        match event {
            Some(FeedEvent::Insert(notification)) => {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = handle_insert(&context, notification) => {}
                }
            }
            Some(FeedEvent::Lagged(skipped)) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    skipped,
                    "live feed lagged; missed inserts arrive with the next load"
                );
            }
            None => {
                tracing::debug!(conversation_id = %conversation_id, "live feed ended");
                shared.publish(epoch, LiveState::Disconnected);
                return;
            }
        }
    }
}

async fn handle_insert(context: &SyncContext, notification: InsertNotification) {
    let conversation_id = context.conversation_id();

    let row = match notification.parse() {
        Ok(row) => row,
        Err(error) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                stage = error.stage(),
                error = %error,
                "dropping malformed insert notification"
            );
            return;
        }
    };

    if row.conversation_id != conversation_id {
        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %row.id,
            "dropping insert for another conversation"
        );
        return;
    }

    // The send path reconciles the viewer's own messages.
    if row.sender_id == context.viewer.id {
        tracing::trace!(message_id = %row.id, "skipping self-sent insert");
        return;
    }

    let Some(record) = hydrate(context, row.id).await else {
        return;
    };
    if record.conversation_id != conversation_id {
        tracing::warn!(
            conversation_id = %conversation_id,
            message_id = %record.id,
            "hydrated row belongs to another conversation"
        );
        return;
    }

    let mut state = context.state.lock().await;
    if !context.is_open() {
        return;
    }
    let message_id = record.id;
    if state.store.append(ChatMessage::from(record)) {
        tracing::debug!(conversation_id = %conversation_id, message_id = %message_id, "appended live message");
        context.read_state.request_now();
    }
}

async fn hydrate(context: &SyncContext, message_id: MessageId) -> Option<MessageRecord> {
    match context.backend.fetch_message_by_id(message_id).await {
        Ok(Some(record)) => Some(record),
        Ok(None) => {
            tracing::warn!(message_id = %message_id, "inserted message not found on fetch");
            None
        }
        Err(error) => {
            tracing::warn!(
                message_id = %message_id,
                stage = error.stage(),
                error = %error,
                "failed to hydrate inserted message"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_state_labels() {
        assert_eq!(LiveState::Disconnected.to_string(), "disconnected");
        assert_eq!(LiveState::Subscribing.as_str(), "subscribing");
        assert_eq!(LiveState::Active.as_str(), "active");
    }
}
