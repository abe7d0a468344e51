use std::time::Duration;

use futures::StreamExt;
use glimpse_storage::{
    ConversationId, ConversationRecord, FeedEvent, HistoryQuery, InsertFeed, MessageSink, MessageSource,
    NewMessage, NewProfile, ProfileSnapshot, ReadReceiptSink, SqliteChatStore, StorageError,
};

struct Fixture {
    store: SqliteChatStore,
    alice: ProfileSnapshot,
    bram: ProfileSnapshot,
    conversation: ConversationRecord,
}

async fn fixture() -> Fixture {
    let store = SqliteChatStore::open(":memory:")
        .await
        .expect("in-memory store opens");
    let alice = store
        .create_profile(NewProfile::new("Alice").with_avatar_url("avatars/alice.png"))
        .await
        .expect("alice profile");
    let bram = store
        .create_profile(NewProfile::new("Bram"))
        .await
        .expect("bram profile");
    let conversation = store
        .create_conversation(alice.id, bram.id)
        .await
        .expect("conversation");

    Fixture {
        store,
        alice,
        bram,
        conversation,
    }
}

async fn send(fixture: &Fixture, sender: &ProfileSnapshot, content: &str) {
    fixture
        .store
        .insert_message(NewMessage::new(fixture.conversation.id, sender.id, content))
        .await
        .expect("insert message");
    // Distinct millisecond timestamps keep cursor assertions deterministic.
    tokio::time::sleep(Duration::from_millis(3)).await;
}

#[tokio::test]
async fn pages_come_back_newest_first_with_exclusive_cursor() {
    let fixture = fixture().await;
    for index in 0..5 {
        send(&fixture, &fixture.alice, &format!("message {index}")).await;
    }

    let newest = fixture
        .store
        .query_messages(fixture.conversation.id, HistoryQuery::latest(3))
        .await
        .expect("latest page");
    let contents = newest
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>();
    assert_eq!(contents, ["message 4", "message 3", "message 2"]);

    let cursor = newest.last().expect("non-empty page").created_at;
    let older = fixture
        .store
        .query_messages(
            fixture.conversation.id,
            HistoryQuery::older_than(cursor, 3),
        )
        .await
        .expect("older page");
    let contents = older
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>();
    assert_eq!(contents, ["message 1", "message 0"]);
}

#[tokio::test]
async fn fetch_by_id_joins_sender_profile() {
    let fixture = fixture().await;
    let inserted = fixture
        .store
        .insert_message(NewMessage::new(
            fixture.conversation.id,
            fixture.alice.id,
            "blue scarf, 7:40 train",
        ))
        .await
        .expect("insert");

    let fetched = fixture
        .store
        .fetch_message_by_id(inserted.id)
        .await
        .expect("fetch")
        .expect("row exists");

    assert_eq!(fetched, inserted);
    assert_eq!(fetched.sender.display_name, "Alice");
    assert_eq!(
        fetched.sender.avatar_url.as_deref(),
        Some("avatars/alice.png")
    );
    assert!(!fetched.is_read);
}

#[tokio::test]
async fn repeated_client_token_returns_the_first_row() {
    let fixture = fixture().await;
    let input = NewMessage::new(fixture.conversation.id, fixture.alice.id, "hello again")
        .with_client_token("optimistic-1700000000000-k3j9x0a1b");

    let first = fixture
        .store
        .insert_message(input.clone())
        .await
        .expect("first insert");
    let second = fixture
        .store
        .insert_message(input)
        .await
        .expect("second insert");

    assert_eq!(first.id, second.id);
    let page = fixture
        .store
        .query_messages(fixture.conversation.id, HistoryQuery::latest(10))
        .await
        .expect("page");
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn conversations_are_loaded_back_by_id() {
    let fixture = fixture().await;

    let loaded = fixture
        .store
        .get_conversation(fixture.conversation.id)
        .await
        .expect("query conversation");
    assert_eq!(loaded, Some(fixture.conversation));
    assert!(loaded.is_some_and(|conversation| conversation.includes(fixture.bram.id)));

    let missing = fixture
        .store
        .get_conversation(ConversationId::new_v7())
        .await
        .expect("query missing conversation");
    assert_eq!(missing, None);
}

#[tokio::test]
async fn non_participant_cannot_post() {
    let fixture = fixture().await;
    let stranger = fixture
        .store
        .create_profile(NewProfile::new("Stranger"))
        .await
        .expect("stranger profile");

    let error = fixture
        .store
        .insert_message(NewMessage::new(
            fixture.conversation.id,
            stranger.id,
            "hi?",
        ))
        .await
        .expect_err("outsider insert is rejected");
    assert!(matches!(error, StorageError::Conflict { .. }));
}

#[tokio::test]
async fn read_state_only_touches_other_senders_unread_rows() {
    let fixture = fixture().await;
    send(&fixture, &fixture.alice, "from alice 1").await;
    send(&fixture, &fixture.alice, "from alice 2").await;
    send(&fixture, &fixture.bram, "from bram").await;

    let touched = fixture
        .store
        .update_read_state(fixture.conversation.id, fixture.bram.id)
        .await
        .expect("update");
    assert_eq!(touched, 2);

    let again = fixture
        .store
        .update_read_state(fixture.conversation.id, fixture.bram.id)
        .await
        .expect("repeat update");
    assert_eq!(again, 0);

    let page = fixture
        .store
        .query_messages(fixture.conversation.id, HistoryQuery::latest(10))
        .await
        .expect("page");
    for message in page {
        assert_eq!(message.is_read, message.sender_id == fixture.alice.id);
    }
}

#[tokio::test]
async fn insert_feed_delivers_only_the_subscribed_conversation() {
    let fixture = fixture().await;
    let carol = fixture
        .store
        .create_profile(NewProfile::new("Carol"))
        .await
        .expect("carol");
    let other = fixture
        .store
        .create_conversation(fixture.alice.id, carol.id)
        .await
        .expect("other conversation");

    let mut subscription = fixture
        .store
        .subscribe_inserts(fixture.conversation.id)
        .await
        .expect("subscribe");

    fixture
        .store
        .insert_message(NewMessage::new(other.id, carol.id, "wrong thread"))
        .await
        .expect("insert elsewhere");
    let inserted = fixture
        .store
        .insert_message(NewMessage::new(
            fixture.conversation.id,
            fixture.bram.id,
            "right thread",
        ))
        .await
        .expect("insert here");

    let event = tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .expect("event arrives")
        .expect("feed open");
    let notification = match event {
        FeedEvent::Insert(notification) => notification,
        other => panic!("expected an insert, got {other:?}"),
    };
    let row = notification.parse().expect("valid row");
    assert_eq!(row.id, inserted.id);
    assert_eq!(row.sender_id, fixture.bram.id);
}

#[tokio::test]
async fn file_backed_store_creates_parent_directories() {
    let directory = tempfile::tempdir().expect("temp dir");
    let location = directory.path().join("nested/chat.db");

    let store = SqliteChatStore::open(&location.display().to_string())
        .await
        .expect("file store opens");
    assert!(location.exists());
    assert!(store.database_url().starts_with("sqlite://"));
}
