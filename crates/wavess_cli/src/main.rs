use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use wavess_core::models::{ChatMode, EmotionSnapshot, UserPreferences};
use wavess_core::{Store, WavessConfig};
use wavess_memory::{fixtures, MigrationKind, Migrator, SqliteStore};
use wavess_reasoning::{TurnOrchestrator, TurnRequest, TurnResult};

#[derive(Parser, Debug)]
#[command(author, version, about = "Wavess companion turn engine", long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "wavess.toml", global = true)]
    config: String,

    /// Override the database path from config
    #[arg(long, env = "DATABASE_PATH", global = true)]
    db: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Database maintenance
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
    /// Scaffold a new migration in the configured migrations directory
    CreateMigration {
        name: String,
        /// sql or code
        #[arg(long = "type", default_value = "sql")]
        kind: String,
    },
    /// Talk to a character from the terminal
    Chat {
        #[arg(long)]
        character: String,
        #[arg(long, default_value = "local-user")]
        user: String,
        /// Resume an existing chat instead of starting a new one
        #[arg(long)]
        chat: Option<String>,
        /// casual or novel
        #[arg(long, default_value = "casual")]
        mode: String,
        /// Keep every turn on the safe provider
        #[arg(long)]
        no_nsfw: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DbAction {
    /// Create the migrations table and apply all migrations
    Init,
    /// Apply pending migrations
    Migrate,
    /// Roll back the most recent migration group
    Rollback,
    /// List migrations and whether they are applied
    Status,
    /// Roll back everything, then migrate from scratch
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Load the sample characters
    Fixtures {
        /// Replace characters that already exist
        #[arg(long)]
        recreate: bool,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_logging(args.log_json);

    let mut config = WavessConfig::load_or_default(&args.config);
    if let Some(db) = &args.db {
        config.store.database_path = db.clone();
    }

    match args.command {
        Command::Db { action } => run_db(&config, action).await,
        Command::CreateMigration { name, kind } => {
            let kind: MigrationKind = kind.parse()?;
            let files =
                wavess_memory::migrations::create_migration(&config.store.migrations_dir, &name, kind)?;
            for f in files {
                println!("Created {}", f.display());
            }
            Ok(())
        }
        Command::Chat {
            character,
            user,
            chat,
            mode,
            no_nsfw,
        } => {
            let mode: ChatMode = mode.parse()?;
            let preferences = UserPreferences {
                nsfw_enabled: !no_nsfw,
                ..UserPreferences::default()
            };
            run_chat(&config, &character, &user, chat, mode, preferences).await
        }
    }
}

// ============================================================================
// db
// ============================================================================

async fn open_store(config: &WavessConfig) -> Result<SqliteStore> {
    Ok(
        SqliteStore::connect(&config.store.database_path, config.store.max_connections)
            .await?
            .with_transient_retries(config.store.transient_retries),
    )
}

fn migrator(store: &SqliteStore, config: &WavessConfig) -> Result<Migrator> {
    store.migrator().with_dir(&config.store.migrations_dir)
}

fn confirm(question: &str) -> Result<bool> {
    let mut rl = DefaultEditor::new()?;
    match rl.readline(&format!("{} [y/N] ", question)) {
        Ok(answer) => Ok(matches!(answer.trim(), "y" | "Y" | "yes")),
        Err(ReadlineError::Interrupted | ReadlineError::Eof) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn run_db(config: &WavessConfig, action: DbAction) -> Result<()> {
    let store = open_store(config).await?;
    let migrator = migrator(&store, config)?;
    info!(database = %config.store.database_path, action = ?action, "Running db command");

    match action {
        DbAction::Init => {
            migrator.init().await?;
            report("Applied", &migrator.migrate().await?);
        }
        DbAction::Migrate => report("Applied", &migrator.migrate().await?),
        DbAction::Rollback => report("Rolled back", &migrator.rollback().await?),
        DbAction::Status => {
            for s in migrator.status().await? {
                let state = match (&s.group, &s.applied_at) {
                    (Some(group), Some(at)) => format!("applied (group {}, {})", group, at),
                    _ => "pending".to_string(),
                };
                println!("{}_{}  {}", s.version, s.name, state);
            }
        }
        DbAction::Reset { yes } => {
            if !yes && !confirm("Reset drops every table. Continue?")? {
                bail!("reset aborted");
            }
            report("Reapplied", &migrator.reset().await?);
        }
        DbAction::Fixtures { recreate } => {
            migrator.migrate().await?;
            let n = fixtures::load(&store, recreate).await?;
            println!("Loaded {} characters", n);
        }
    }
    Ok(())
}

fn report(verb: &str, ids: &[String]) {
    if ids.is_empty() {
        println!("Nothing to do");
    }
    for id in ids {
        println!("{} {}", verb, id);
    }
}

// ============================================================================
// chat
// ============================================================================

fn print_reply(name: &str, r: &TurnResult) {
    println!("\n{}: {}\n", name, r.content);
    println!(
        "  [{} | L{} | 好感度 {} | {} | {}ms]",
        r.engine,
        r.level,
        r.affection,
        r.relationship.display_name(),
        r.latency_ms
    );
    if let Some(event) = &r.special_event {
        println!("  ✦ {}", event.description());
    }
    println!();
}

fn print_timeline(snapshots: &[EmotionSnapshot]) {
    if snapshots.is_empty() {
        println!("  (no emotion changes yet)");
    }
    for s in snapshots {
        println!(
            "  {}  {} -> {}  {} -> {}  [{}]",
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.affection_before,
            s.affection_after,
            s.mood_before,
            s.mood_after,
            s.trigger_type
        );
    }
    println!();
}

async fn run_chat(
    config: &WavessConfig,
    character_id: &str,
    user_id: &str,
    chat_id: Option<String>,
    mode: ChatMode,
    preferences: UserPreferences,
) -> Result<()> {
    let store = Arc::new(
        SqliteStore::new(&config.store.database_path)
            .await?
            .with_transient_retries(config.store.transient_retries),
    );
    let character = store
        .get_character(character_id)
        .await?
        .with_context(|| format!("Unknown character {} (try `wavess db fixtures`)", character_id))?;
    let engine = TurnOrchestrator::from_config(config, store.clone())?;

    let resumed = chat_id.is_some();
    let chat_id = chat_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(chat_id = %chat_id, character_id, user_id, mode = %mode, "Chat session started");
    println!("Chat {} with {}. Type /regen to retry the last reply, /timeline for emotion history, /quit to exit.", chat_id, character.name);

    if !resumed {
        match engine
            .process_welcome(&chat_id, user_id, character_id, mode)
            .await
        {
            Ok(r) => print_reply(&character.name, &r),
            Err(e) => {
                error!(kind = e.kind().as_str(), "Welcome failed: {}", e);
                println!("[{}] {}", e.kind().as_str(), e);
            }
        }
    }

    let mut rl = DefaultEditor::new()?;
    loop {
        let line = match rl.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(text);

        let outcome = match text {
            "/quit" | "/exit" => break,
            "/timeline" => {
                print_timeline(&engine.emotion().timeline(user_id, character_id));
                continue;
            }
            "/regen" => {
                engine
                    .regenerate(&chat_id, user_id, character_id, &preferences)
                    .await
            }
            _ => {
                let req = TurnRequest::new(&chat_id, user_id, character_id, text)
                    .with_mode(mode)
                    .with_preferences(preferences.clone());
                engine.process_message(req).await
            }
        };
        match outcome {
            Ok(r) => print_reply(&character.name, &r),
            Err(e) => {
                error!(kind = e.kind().as_str(), "Turn failed: {}", e);
                println!("[{}] {}", e.kind().as_str(), e);
            }
        }
    }

    println!("Bye.");
    Ok(())
}
