use chrono::Utc;
use glimpse_storage::NewMessage;
use snafu::{IntoError, ensure};

use super::context::SyncContext;
use super::format::generate_optimistic_id;
use super::message::{ChatMessage, Delivery, OptimisticId};
use crate::error::{
    EmptyMessageSnafu, NotDiscardableSnafu, NotRetryableSnafu, SendFailedSnafu,
    SessionClosedSnafu, SyncResult,
};

/// Appends a pending entry, inserts the row and swaps the entry for the confirmed row.
pub(crate) async fn send(context: &SyncContext, content: &str) -> SyncResult<ChatMessage> {
    let content = content.trim();
    ensure!(!content.is_empty(), EmptyMessageSnafu { stage: "send-validate" });

    let optimistic_id = generate_optimistic_id();
    {
        let mut state = context.state.lock().await;
        ensure!(
            context.is_open(),
            SessionClosedSnafu {
                stage: "send-append-pending",
                conversation_id: context.conversation_id(),
            }
        );
        state.store.append(ChatMessage::pending(
            optimistic_id.clone(),
            context.conversation_id(),
            context.viewer.clone(),
            content,
            Utc::now(),
        ));
        context.after_mutation(&state.store);
    }

    tracing::debug!(
        conversation_id = %context.conversation_id(),
        optimistic_id = %optimistic_id,
        "sending message"
    );
    deliver(context, optimistic_id, content.to_string()).await
}

/// Resends a failed entry with its original token.
pub(crate) async fn retry(
    context: &SyncContext,
    optimistic_id: &OptimisticId,
) -> SyncResult<ChatMessage> {
    let pending = {
        let mut state = context.state.lock().await;
        ensure!(
            context.is_open(),
            SessionClosedSnafu {
                stage: "send-retry",
                conversation_id: context.conversation_id(),
            }
        );
        let Some(pending) = state.store.mark_sending(optimistic_id) else {
            return NotRetryableSnafu {
                stage: "send-retry",
                optimistic_id: optimistic_id.to_string(),
            }
            .fail();
        };
        context.after_mutation(&state.store);
        pending
    };

    tracing::debug!(optimistic_id = %optimistic_id, "retrying failed message");
    deliver(context, optimistic_id.clone(), pending.content).await
}

pub(crate) async fn discard(context: &SyncContext, optimistic_id: &OptimisticId) -> SyncResult<()> {
    let mut state = context.state.lock().await;
    ensure!(
        state.store.remove_failed(optimistic_id),
        NotDiscardableSnafu {
            stage: "send-discard",
            optimistic_id: optimistic_id.to_string(),
        }
    );
    context.after_mutation(&state.store);
    Ok(())
}

async fn deliver(
    context: &SyncContext,
    optimistic_id: OptimisticId,
    content: String,
) -> SyncResult<ChatMessage> {
    let input = NewMessage::new(context.conversation_id(), context.viewer.id, content)
        .with_client_token(optimistic_id.as_str());
    let result = context.backend.insert_message(input).await;

    let mut state = context.state.lock().await;
    match result {
        Ok(record) => {
            let mut confirmed = ChatMessage::from(record);
            // The row answers this insert even if the backend dropped the token.
            confirmed.client_token = Some(optimistic_id.clone());
            confirmed.delivery = Delivery::Sent;

            if context.is_open() {
                state.store.append(confirmed.clone());
                context.after_mutation(&state.store);
            }
            tracing::debug!(
                optimistic_id = %optimistic_id,
                message_id = %confirmed.key,
                "message confirmed"
            );
            Ok(confirmed)
        }
        Err(error) => {
            tracing::warn!(
                optimistic_id = %optimistic_id,
                stage = error.stage(),
                error = %error,
                "message send failed"
            );
            if context.is_open() {
                state.store.mark_failed(&optimistic_id, error.to_string());
            }
            Err(SendFailedSnafu {
                stage: "send-insert",
                optimistic_id: optimistic_id.to_string(),
            }
            .into_error(error))
        }
    }
}
