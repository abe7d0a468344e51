use std::env;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use glimpse_chat::chat::{
    ConversationSession, Delivery, LoadOutcome, LiveState, MessageSnapshot, SkipReason,
};
use glimpse_chat::settings::{SettingsStore, SyncSettings};
use glimpse_chat::{SyncError, telemetry};
use glimpse_storage::{
    ChatBackend, ConversationRecord, HistoryQuery, MessageSink, MessageSource, NewMessage,
    NewProfile, ProfileSnapshot, SqliteChatStore, StorageError,
};

const LIVE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_location: String,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    EndToEnd,
    Pagination,
    LiveFeed,
    OptimisticSend,
    ReadState,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "end_to_end" => Some(Self::EndToEnd),
            "pagination" => Some(Self::Pagination),
            "live_feed" => Some(Self::LiveFeed),
            "optimistic_send" => Some(Self::OptimisticSend),
            "read_state" => Some(Self::ReadState),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::EndToEnd => "end_to_end",
            Self::Pagination => "pagination",
            Self::LiveFeed => "live_feed",
            Self::OptimisticSend => "optimistic_send",
            Self::ReadState => "read_state",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage operation failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sync operation failed on `{stage}`: {source}"))]
    Sync {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("conversation '{conversation_id}' not found after creation"))]
    MissingConversation {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

struct Fixture {
    store: Arc<SqliteChatStore>,
    alice: ProfileSnapshot,
    bram: ProfileSnapshot,
    conversation: ConversationRecord,
}

impl Fixture {
    async fn open(db_location: &str) -> RunnerResult<Self> {
        let store = SqliteChatStore::open(db_location)
            .await
            .context(StorageSnafu {
                stage: "fixture-open-store",
            })?;
        let alice = store
            .create_profile(NewProfile::new("Alice"))
            .await
            .context(StorageSnafu {
                stage: "fixture-create-alice",
            })?;
        let bram = store
            .create_profile(NewProfile::new("Bram"))
            .await
            .context(StorageSnafu {
                stage: "fixture-create-bram",
            })?;
        let created = store
            .create_conversation(alice.id, bram.id)
            .await
            .context(StorageSnafu {
                stage: "fixture-create-conversation",
            })?;
        let conversation = store
            .get_conversation(created.id)
            .await
            .context(StorageSnafu {
                stage: "fixture-load-conversation",
            })?
            .context(MissingConversationSnafu {
                stage: "fixture-load-conversation",
                conversation_id: created.id.to_string(),
            })?;

        Ok(Self {
            store: Arc::new(store),
            alice,
            bram,
            conversation,
        })
    }

    fn backend(&self) -> Arc<dyn ChatBackend> {
        self.store.clone()
    }

    fn session(&self, settings: &SyncSettings) -> RunnerResult<ConversationSession> {
        ConversationSession::open(
            self.backend(),
            self.conversation.clone(),
            self.alice.clone(),
            settings,
        )
        .context(SyncSnafu {
            stage: "fixture-open-session",
        })
    }

    async fn post(&self, sender: &ProfileSnapshot, content: &str) -> RunnerResult<()> {
        self.store
            .insert_message(NewMessage::new(self.conversation.id, sender.id, content))
            .await
            .context(StorageSnafu {
                stage: "fixture-post-message",
            })?;
        // Distinct millisecond timestamps keep the pagination cursor unambiguous.
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let settings = SettingsStore::load().settings();
    telemetry::init_tracing(&settings.log_filter);

    println!("scenario={}", args.scenario.name());
    println!("db_location={}", args.db_location);

    let settings = (*settings)
        .clone()
        .with_database_location(args.db_location.clone());
    match args.scenario {
        Scenario::EndToEnd => run_end_to_end(&settings).await,
        Scenario::Pagination => run_pagination(&settings).await,
        Scenario::LiveFeed => run_live_feed(&settings).await,
        Scenario::OptimisticSend => run_optimistic_send(&settings).await,
        Scenario::ReadState => run_read_state(&settings).await,
        Scenario::All => run_all(&settings).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_location = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_location = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_location: db_location.unwrap_or_else(|| ":memory:".to_string()),
    })
}

async fn run_all(settings: &SyncSettings) -> RunnerResult<()> {
    run_end_to_end(settings).await?;
    run_pagination(settings).await?;
    run_live_feed(settings).await?;
    run_optimistic_send(settings).await?;
    run_read_state(settings).await?;
    println!("all=true");
    Ok(())
}

async fn run_end_to_end(settings: &SyncSettings) -> RunnerResult<()> {
    const SCENARIO: &str = "end_to_end";
    let fixture = Fixture::open(&settings.database_location).await?;
    for index in 0..20 {
        fixture.post(&fixture.bram, &format!("message {index}")).await?;
    }

    let session = fixture.session(&settings.clone().with_page_size(20))?;
    let initial = session.load_initial().await.context(SyncSnafu {
        stage: "end-to-end-load-initial",
    })?;
    let before = session.view().await;
    check(
        SCENARIO,
        initial
            == LoadOutcome::Loaded {
                fetched: 20,
                has_more: true,
            },
        format!("unexpected initial outcome {initial:?}"),
    )?;
    check(
        SCENARIO,
        is_chronological(&before.messages),
        "initial page is not chronological".to_string(),
    )?;

    let older = session.load_older().await.context(SyncSnafu {
        stage: "end-to-end-load-older",
    })?;
    let after = session.view().await;
    check(
        SCENARIO,
        older
            == LoadOutcome::Loaded {
                fetched: 0,
                has_more: false,
            },
        format!("unexpected older outcome {older:?}"),
    )?;
    check(
        SCENARIO,
        same_keys(&before.messages, &after.messages),
        "empty older page changed the list".to_string(),
    )?;

    println!("end_to_end_messages={}", after.messages.len());
    println!("end_to_end_has_more={}", after.has_more);
    println!("runner_ok=true");
    Ok(())
}

async fn run_pagination(settings: &SyncSettings) -> RunnerResult<()> {
    const SCENARIO: &str = "pagination";
    let fixture = Fixture::open(&settings.database_location).await?;
    for index in 0..45 {
        fixture.post(&fixture.bram, &format!("page message {index}")).await?;
    }

    let session = fixture.session(&settings.clone().with_page_size(20))?;
    session.load_initial().await.context(SyncSnafu {
        stage: "pagination-load-initial",
    })?;

    let mut pages = 1;
    loop {
        match session.load_older().await.context(SyncSnafu {
            stage: "pagination-load-older",
        })? {
            LoadOutcome::Loaded { .. } => pages += 1,
            LoadOutcome::Skipped(SkipReason::Exhausted) => break,
            other => {
                return ScenarioFailedSnafu {
                    stage: "pagination-unexpected-skip",
                    scenario: SCENARIO,
                    reason: format!("unexpected outcome {other:?}"),
                }
                .fail();
            }
        }
    }

    let view = session.view().await;
    check(
        SCENARIO,
        view.messages.len() == 45 && is_chronological(&view.messages),
        format!("expected 45 ordered messages, got {}", view.messages.len()),
    )?;

    println!("pagination_pages={pages}");
    println!("runner_ok=true");
    Ok(())
}

async fn run_live_feed(settings: &SyncSettings) -> RunnerResult<()> {
    const SCENARIO: &str = "live_feed";
    let fixture = Fixture::open(&settings.database_location).await?;
    let session = fixture.session(settings)?;
    session.load_initial().await.context(SyncSnafu {
        stage: "live-feed-load-initial",
    })?;
    wait_for_live(&session).await?;

    let mut snapshots = session.subscribe().await;
    fixture.post(&fixture.alice, "from this device").await?;
    fixture.post(&fixture.bram, "from the other side").await?;

    let arrived = tokio::time::timeout(LIVE_WAIT, async {
        loop {
            if snapshots.borrow_and_update().len() == 1 {
                return true;
            }
            if snapshots.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);
    check(SCENARIO, arrived, "live message never arrived".to_string())?;

    let view = session.view().await;
    let only_other = view
        .messages
        .iter()
        .all(|message| message.sender_id == fixture.bram.id);
    check(
        SCENARIO,
        only_other,
        "self-sent insert reached the store".to_string(),
    )?;

    println!("live_feed_messages={}", view.messages.len());
    println!("runner_ok=true");
    Ok(())
}

async fn run_optimistic_send(settings: &SyncSettings) -> RunnerResult<()> {
    const SCENARIO: &str = "optimistic_send";
    let fixture = Fixture::open(&settings.database_location).await?;
    let session = fixture.session(settings)?;
    session.load_initial().await.context(SyncSnafu {
        stage: "optimistic-send-load-initial",
    })?;

    let confirmed = session.send("  see you at the corner  ").await.context(SyncSnafu {
        stage: "optimistic-send",
    })?;
    let view = session.view().await;
    check(
        SCENARIO,
        view.messages.len() == 1
            && view.messages[0].key == confirmed.key
            && view.messages[0].delivery == Delivery::Sent,
        format!("unexpected list after send: {:?}", view.messages),
    )?;

    let rows = fixture
        .store
        .query_messages(fixture.conversation.id, HistoryQuery::latest(10))
        .await
        .context(StorageSnafu {
            stage: "optimistic-send-query",
        })?;
    check(
        SCENARIO,
        rows.len() == 1 && rows[0].content == "see you at the corner",
        "stored row does not match the sent message".to_string(),
    )?;

    session.load_initial().await.context(SyncSnafu {
        stage: "optimistic-send-reload",
    })?;
    check(
        SCENARIO,
        session.view().await.messages.len() == 1,
        "reload duplicated the sent message".to_string(),
    )?;

    println!("optimistic_send_token={}", rows[0].client_token.as_deref().unwrap_or(""));
    println!("runner_ok=true");
    Ok(())
}

async fn run_read_state(settings: &SyncSettings) -> RunnerResult<()> {
    const SCENARIO: &str = "read_state";
    let fixture = Fixture::open(&settings.database_location).await?;
    fixture.post(&fixture.bram, "are you there?").await?;
    fixture.post(&fixture.alice, "yes").await?;

    let session = fixture.session(settings)?;
    session.load_initial().await.context(SyncSnafu {
        stage: "read-state-load-initial",
    })?;
    session.mark_read().await;

    let rows = fixture
        .store
        .query_messages(fixture.conversation.id, HistoryQuery::latest(10))
        .await
        .context(StorageSnafu {
            stage: "read-state-query",
        })?;
    let other_read = rows
        .iter()
        .filter(|row| row.sender_id == fixture.bram.id)
        .all(|row| row.is_read);
    let own_unread = rows
        .iter()
        .filter(|row| row.sender_id == fixture.alice.id)
        .all(|row| !row.is_read);
    check(
        SCENARIO,
        other_read && own_unread,
        "read state touched the wrong rows".to_string(),
    )?;

    println!("read_state_updates={}", session.read_state().issued());
    println!("runner_ok=true");
    Ok(())
}

async fn wait_for_live(session: &ConversationSession) -> RunnerResult<()> {
    let mut live = session.watch_live_state();
    let active = tokio::time::timeout(LIVE_WAIT, live.wait_for(|state| *state == LiveState::Active))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);

    check(
        "live_feed",
        active,
        format!("live subscription stuck in {}", session.live_state()),
    )
}

fn check(scenario: &'static str, condition: bool, reason: String) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }

    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason,
    }
    .fail()
}

fn is_chronological(messages: &MessageSnapshot) -> bool {
    messages
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at)
}

fn same_keys(left: &MessageSnapshot, right: &MessageSnapshot) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right.iter())
            .all(|(left, right)| left.key == right.key)
}
