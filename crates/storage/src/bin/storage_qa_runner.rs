use std::collections::HashSet;
use std::env;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use parley_storage::{
    Conversation, ConversationId, ConversationStore, Message, MessageId, ResponseStats,
    SettingsStore, SqliteStorage, StorageError,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdUnique,
    SchemaInit,
    FkViolation,
    ConversationRoundtrip,
    SettingsRoundtrip,
    ClearAll,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_unique" => Some(Self::IdUnique),
            "schema_init" => Some(Self::SchemaInit),
            "fk_violation" => Some(Self::FkViolation),
            "conversation_roundtrip" => Some(Self::ConversationRoundtrip),
            "settings_roundtrip" => Some(Self::SettingsRoundtrip),
            "clear_all" => Some(Self::ClearAll),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdUnique => "id_unique",
            Self::SchemaInit => "schema_init",
            Self::FkViolation => "fk_violation",
            Self::ConversationRoundtrip => "conversation_roundtrip",
            Self::SettingsRoundtrip => "settings_roundtrip",
            Self::ClearAll => "clear_all",
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
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // stdout carries the key=value report, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdUnique => run_id_unique(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::FkViolation => run_fk_violation(require_db_path(&args, "fk_violation")?).await,
        Scenario::ConversationRoundtrip => {
            run_conversation_roundtrip(require_db_path(&args, "conversation_roundtrip")?).await
        }
        Scenario::SettingsRoundtrip => {
            run_settings_roundtrip(require_db_path(&args, "settings_roundtrip")?).await
        }
        Scenario::ClearAll => run_clear_all(require_db_path(&args, "clear_all")?).await,
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
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
                db_path = Some(value);
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
        db_path,
    })
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

async fn open_initialized(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })?;
    storage
        .init()
        .await
        .context(StorageValidationSnafu { stage })?;
    Ok(storage)
}

fn run_id_unique() -> RunnerResult<()> {
    let minted = (0..10_000)
        .map(|_| MessageId::generate())
        .collect::<HashSet<_>>();
    let id_unique = minted.len() == 10_000;

    println!("id_unique={id_unique}");
    if !id_unique {
        return ScenarioFailedSnafu {
            stage: "scenario-id-unique",
            scenario: "id_unique",
            reason: format!("expected 10000 distinct ids but minted {}", minted.len()),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_unique()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_fk_violation(path).await?;
        run_conversation_roundtrip(path).await?;
        run_settings_roundtrip(path).await?;
        run_clear_all(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = open_initialized(db_path, "scenario-schema-init-open").await?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('conversations', 'messages', 'settings')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = ["conversations", "messages", "settings"]
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-foreign-keys",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");

    if !schema_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-schema",
            scenario: "schema_init",
            reason: "expected migration tables are missing".to_string(),
        }
        .fail();
    }

    if journal_mode != "wal" {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-journal-mode",
            scenario: "schema_init",
            reason: format!("expected journal_mode=wal but was {journal_mode}"),
        }
        .fail();
    }

    if foreign_keys != 1 {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-foreign-keys",
            scenario: "schema_init",
            reason: format!("expected foreign_keys=1 but was {foreign_keys}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_fk_violation(db_path: &str) -> RunnerResult<()> {
    let storage = open_initialized(db_path, "scenario-fk-violation-open").await?;

    let insert_result = sqlx::query(
        "INSERT INTO messages (conversation_id, seq, id, role, content, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(ConversationId::generate().into_inner())
    .bind(0_i64)
    .bind(MessageId::generate().into_inner())
    .bind("user")
    .bind("orphan-row")
    .bind(parley_storage::current_timestamp())
    .execute(storage.pool())
    .await;

    let fk_violation_blocked = insert_result.is_err();
    println!("fk_violation_blocked={fk_violation_blocked}");
    if !fk_violation_blocked {
        return ScenarioFailedSnafu {
            stage: "scenario-fk-violation-assert",
            scenario: "fk_violation",
            reason: "orphan message row was accepted".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_conversation_roundtrip(db_path: &str) -> RunnerResult<()> {
    let storage = open_initialized(db_path, "scenario-conversation-roundtrip-open").await?;

    let mut conversation = Conversation::with_greeting(ConversationId::generate(), "QA round trip");
    conversation.messages.push(Message::user(
        MessageId::generate(),
        "Describe this",
        vec!["data:image/png;base64,iVBORw0KGgo=".to_string()],
    ));
    let mut reply = Message::assistant(MessageId::generate(), "A single pixel.");
    reply.stats = Some(ResponseStats {
        tokens_per_second: 12.5,
        time_to_first_token: 0.2,
        total_time: 0.24,
        total_tokens: 3,
        model: "llama-3.3-70b-versatile".to_string(),
    });
    conversation.messages.push(reply);

    storage
        .save_conversation(&conversation)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-conversation-roundtrip-save",
        })?;
    let reloaded = storage
        .list_conversations()
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-conversation-roundtrip-list",
        })?
        .into_iter()
        .find(|candidate| candidate.id == conversation.id);

    let roundtrip_ok = reloaded.as_ref() == Some(&conversation);
    println!("conversation_roundtrip={roundtrip_ok}");
    if !roundtrip_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-conversation-roundtrip-assert",
            scenario: "conversation_roundtrip",
            reason: format!("reloaded conversation differs: {reloaded:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_settings_roundtrip(db_path: &str) -> RunnerResult<()> {
    let storage = open_initialized(db_path, "scenario-settings-roundtrip-open").await?;

    storage
        .save_setting("systemPrompt", "first")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-settings-roundtrip-save-first",
        })?;
    storage
        .save_setting("systemPrompt", "second")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-settings-roundtrip-save-second",
        })?;
    let value = storage
        .get_setting("systemPrompt")
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-settings-roundtrip-get",
        })?;

    println!("settings_value={}", value.as_deref().unwrap_or("<none>"));
    if value.as_deref() != Some("second") {
        return ScenarioFailedSnafu {
            stage: "scenario-settings-roundtrip-assert",
            scenario: "settings_roundtrip",
            reason: format!("expected 'second' but read {value:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_clear_all(db_path: &str) -> RunnerResult<()> {
    let storage = open_initialized(db_path, "scenario-clear-all-open").await?;

    storage
        .save_conversation(&Conversation::with_greeting(
            ConversationId::generate(),
            "to be cleared",
        ))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-clear-all-seed",
        })?;
    storage
        .clear_conversations()
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-clear-all-clear",
        })?;

    let remaining = storage
        .list_conversations()
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-clear-all-list",
        })?
        .len();
    let orphaned_messages = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
        .fetch_one(storage.pool())
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-clear-all-count-messages",
        })?;

    println!("remaining_conversations={remaining}");
    println!("orphaned_messages={orphaned_messages}");
    if remaining != 0 || orphaned_messages != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-clear-all-assert",
            scenario: "clear_all",
            reason: format!("{remaining} conversations and {orphaned_messages} messages survived"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}
