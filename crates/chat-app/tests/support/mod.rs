#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use glimpse_chat::chat::{ConversationSession, LiveState, MessageSnapshot};
use glimpse_chat::settings::SyncSettings;
use glimpse_storage::{
    BoxFuture, ChatBackend, ConversationId, ConversationRecord, FeedEvent, HistoryQuery,
    InsertFeed, InsertNotification, InsertSubscription, MessageId, MessageRecord, MessageSink,
    MessageSource, NewMessage, ProfileId, ProfileSnapshot, ReadReceiptSink, StorageError,
    StorageResult,
};
use tokio::sync::{broadcast, watch};

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct Faults {
    pub query: AtomicBool,
    pub fetch: AtomicBool,
    pub insert: AtomicBool,
    pub read_state: AtomicBool,
    pub subscribe: AtomicBool,
}

#[derive(Default)]
pub struct Calls {
    pub query: AtomicUsize,
    pub fetch: AtomicUsize,
    pub insert: AtomicUsize,
    pub read_state: AtomicUsize,
    pub subscribe: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Acquire)
    }
}

/// In-memory backend with deterministic timestamps, one minute apart.
pub struct FakeBackend {
    rows: Mutex<Vec<MessageRecord>>,
    profiles: Vec<ProfileSnapshot>,
    feed: broadcast::Sender<FeedEvent>,
    query_gate: watch::Sender<bool>,
    next_minute: AtomicUsize,
    pub faults: Faults,
    pub calls: Calls,
}

impl FakeBackend {
    pub fn new(profiles: Vec<ProfileSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            profiles,
            feed: broadcast::channel(64).0,
            query_gate: watch::channel(true).0,
            next_minute: AtomicUsize::new(0),
            faults: Faults::default(),
            calls: Calls::default(),
        })
    }

    fn rows(&self) -> MutexGuard<'_, Vec<MessageRecord>> {
        self.rows.lock().expect("fake rows lock")
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let minute = self.next_minute.fetch_add(1, Ordering::AcqRel) as i64;
        base_time() + chrono::Duration::minutes(minute)
    }

    fn profile(&self, id: ProfileId) -> ProfileSnapshot {
        self.profiles
            .iter()
            .find(|profile| profile.id == id)
            .cloned()
            .unwrap_or_else(|| ProfileSnapshot {
                id,
                display_name: "Unknown".to_string(),
                avatar_url: None,
            })
    }

    /// Writes a row without notifying subscribers.
    pub fn seed(&self, conversation_id: ConversationId, sender_id: ProfileId, content: &str) -> MessageRecord {
        let record = MessageRecord {
            id: MessageId::new_v7(),
            conversation_id,
            sender_id,
            content: content.to_string(),
            created_at: self.next_timestamp(),
            is_read: false,
            client_token: None,
            sender: self.profile(sender_id),
        };
        self.rows().push(record.clone());
        record
    }

    /// Writes a row as if an insert carrying `client_token` had committed.
    pub fn seed_with_token(
        &self,
        conversation_id: ConversationId,
        sender_id: ProfileId,
        content: &str,
        client_token: &str,
    ) -> MessageRecord {
        let mut record = self.seed(conversation_id, sender_id, content);
        record.client_token = Some(client_token.to_string());
        if let Some(row) = self.rows().iter_mut().find(|row| row.id == record.id) {
            row.client_token = record.client_token.clone();
        }
        record
    }

    /// Writes a row and broadcasts it, like another client posting.
    pub fn post(&self, conversation_id: ConversationId, sender_id: ProfileId, content: &str) -> MessageRecord {
        let record = self.seed(conversation_id, sender_id, content);
        self.notify(InsertNotification::from_record(&record));
        record
    }

    pub fn notify(&self, notification: InsertNotification) {
        let _ = self.feed.send(FeedEvent::Insert(notification));
    }

    pub fn lag(&self, skipped: u64) {
        let _ = self.feed.send(FeedEvent::Lagged(skipped));
    }

    pub fn feed_receivers(&self) -> usize {
        self.feed.receiver_count()
    }

    pub fn hold_queries(&self) {
        self.query_gate.send_replace(false);
    }

    pub fn release_queries(&self) {
        self.query_gate.send_replace(true);
    }

    pub fn stored(&self) -> Vec<MessageRecord> {
        self.rows().clone()
    }

    pub fn fail(flag: &AtomicBool, enabled: bool) {
        flag.store(enabled, Ordering::Release);
    }

    fn injected(stage: &'static str) -> StorageError {
        StorageError::InvariantViolation {
            stage,
            details: "injected failure".to_string(),
        }
    }
}

impl MessageSource for FakeBackend {
    fn query_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            // Rows are read before the gate, so a held query returns a stale page.
            let mut rows = self
                .rows()
                .iter()
                .filter(|row| row.conversation_id == conversation_id)
                .filter(|row| query.before.is_none_or(|before| row.created_at < before))
                .cloned()
                .collect::<Vec<_>>();
            rows.sort_by(|left, right| right.created_at.cmp(&left.created_at));
            rows.truncate(query.limit as usize);

            self.calls.query.fetch_add(1, Ordering::AcqRel);
            let mut gate = self.query_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;

            if self.faults.query.load(Ordering::Acquire) {
                return Err(Self::injected("fake-query"));
            }
            Ok(rows)
        })
    }

    fn fetch_message_by_id<'a>(
        &'a self,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            self.calls.fetch.fetch_add(1, Ordering::AcqRel);
            if self.faults.fetch.load(Ordering::Acquire) {
                return Err(Self::injected("fake-fetch"));
            }
            Ok(self.rows().iter().find(|row| row.id == message_id).cloned())
        })
    }
}

impl MessageSink for FakeBackend {
    fn insert_message<'a>(
        &'a self,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.calls.insert.fetch_add(1, Ordering::AcqRel);
            if self.faults.insert.load(Ordering::Acquire) {
                return Err(Self::injected("fake-insert"));
            }

            if let Some(token) = input.client_token.as_deref() {
                let existing = self
                    .rows()
                    .iter()
                    .find(|row| {
                        row.conversation_id == input.conversation_id
                            && row.client_token.as_deref() == Some(token)
                    })
                    .cloned();
                if let Some(existing) = existing {
                    return Ok(existing);
                }
            }

            let record = MessageRecord {
                id: MessageId::new_v7(),
                conversation_id: input.conversation_id,
                sender_id: input.sender_id,
                content: input.content,
                created_at: self.next_timestamp(),
                is_read: false,
                client_token: input.client_token,
                sender: self.profile(input.sender_id),
            };
            self.rows().push(record.clone());
            self.notify(InsertNotification::from_record(&record));
            Ok(record)
        })
    }
}

impl ReadReceiptSink for FakeBackend {
    fn update_read_state<'a>(
        &'a self,
        conversation_id: ConversationId,
        reader_id: ProfileId,
    ) -> BoxFuture<'a, StorageResult<u64>> {
        Box::pin(async move {
            self.calls.read_state.fetch_add(1, Ordering::AcqRel);
            if self.faults.read_state.load(Ordering::Acquire) {
                return Err(Self::injected("fake-read-state"));
            }

            let mut updated = 0;
            for row in self.rows().iter_mut() {
                if row.conversation_id == conversation_id && row.sender_id != reader_id && !row.is_read {
                    row.is_read = true;
                    updated += 1;
                }
            }
            Ok(updated)
        })
    }
}

impl InsertFeed for FakeBackend {
    fn subscribe_inserts<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<InsertSubscription>> {
        Box::pin(async move {
            self.calls.subscribe.fetch_add(1, Ordering::AcqRel);
            if self.faults.subscribe.load(Ordering::Acquire) {
                return Err(Self::injected("fake-subscribe"));
            }

            // Conversation filtering is left to the subscriber so it can be exercised.
            let receiver = self.feed.subscribe();
            let events = futures::stream::unfold(receiver, |mut receiver| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => return Some((event, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            return Some((FeedEvent::Lagged(skipped), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .boxed();
            Ok(InsertSubscription::new(conversation_id, events))
        })
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0)
        .single()
        .expect("valid date")
}

pub fn profile(name: &str) -> ProfileSnapshot {
    ProfileSnapshot {
        id: ProfileId::new_v7(),
        display_name: name.to_string(),
        avatar_url: None,
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub viewer: ProfileSnapshot,
    pub other: ProfileSnapshot,
    pub conversation: ConversationRecord,
}

impl Harness {
    pub fn new() -> Self {
        let viewer = profile("Alice");
        let other = profile("Bram");
        let backend = FakeBackend::new(vec![viewer.clone(), other.clone()]);
        let conversation = ConversationRecord {
            id: ConversationId::new_v7(),
            participant_a: viewer.id,
            participant_b: other.id,
        };
        Self {
            backend,
            viewer,
            other,
            conversation,
        }
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        self.backend.clone()
    }

    pub fn settings(page_size: u32) -> SyncSettings {
        SyncSettings::default()
            .with_page_size(page_size)
            .with_read_state_debounce_ms(0)
    }

    pub fn open(&self, settings: &SyncSettings) -> ConversationSession {
        ConversationSession::open(
            self.backend(),
            self.conversation.clone(),
            self.viewer.clone(),
            settings,
        )
        .expect("viewer is a participant")
    }

    pub fn seed_from_other(&self, count: usize) -> Vec<MessageRecord> {
        (0..count)
            .map(|index| {
                self.backend
                    .seed(self.conversation.id, self.other.id, &format!("message {index}"))
            })
            .collect()
    }
}

pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

pub async fn wait_for_len(session: &ConversationSession, len: usize) -> MessageSnapshot {
    let mut snapshots = session.subscribe().await;
    let _ = tokio::time::timeout(WAIT, snapshots.wait_for(|snapshot| snapshot.len() == len)).await;
    let snapshot = snapshots.borrow().clone();
    snapshot
}

pub async fn wait_for_live(session: &ConversationSession, expected: LiveState) -> bool {
    let mut live = session.watch_live_state();
    tokio::time::timeout(WAIT, live.wait_for(|state| *state == expected))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false)
}

pub fn contents(snapshot: &MessageSnapshot) -> Vec<String> {
    snapshot
        .iter()
        .map(|message| message.content.clone())
        .collect()
}
