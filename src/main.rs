//! # Slack Archive CLI (`slack-archive`)
//!
//! Operator interface for indexing a Slack export and querying the index.
//!
//! ## Usage
//!
//! ```bash
//! slack-archive --config ./slack-archive.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `init` | Create the processed-file ledger |
//! | `index` | Run one indexing pass over the export |
//! | `chats` | List chats with their ids and types |
//! | `count <chat>` | Number of top-level messages in a chat |
//! | `messages <chat>` | Print a window, a thread, or every message as JSON |
//! | `search "<query>"` | Full-text search, newest first |
//! | `ping` | Check that the search engine answers |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `slack_archive=info`).

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use slack_archive::archive::ArchiveStore;
use slack_archive::config::{self, Config};
use slack_archive::engine::{self, SearchEngine};
use slack_archive::ingest::Pipeline;
use slack_archive::ledger::Ledger;
use slack_archive::query::{initial_offset, ArchiveApi, MessageSelector};

/// Slack Archive: incremental indexing and retrieval for Slack exports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "slack-archive", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./slack-archive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the processed-file ledger. Idempotent.
    Init,

    /// Index every export file not yet recorded in the ledger.
    ///
    /// Exits with an error when any chat failed; its files are retried on
    /// the next run.
    Index,

    /// List chats of the export.
    Chats,

    /// Count top-level messages of a chat.
    Count {
        /// Chat id, e.g. `C0123ABCD`.
        chat: String,
    },

    /// Print messages of a chat as JSON.
    ///
    /// Without `--start`, the window opens on the last page.
    Messages {
        chat: String,

        /// First position of the window.
        #[arg(long)]
        start: Option<u64>,

        /// Window size.
        #[arg(long, default_value = "50")]
        rows: u64,

        /// Print the thread started at this ts instead of a window.
        #[arg(long, conflicts_with = "start")]
        thread: Option<String>,

        /// Print every message of the chat from the export files.
        #[arg(long, conflicts_with_all = ["start", "thread"])]
        all: bool,
    },

    /// Full-text search over message text.
    Search {
        query: String,

        /// Maximum number of hits.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Check that the search engine is reachable.
    Ping,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slack_archive=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_api(cfg: &Config, engine: Arc<dyn SearchEngine>) -> Result<ArchiveApi> {
    let archive = Arc::new(ArchiveStore::new(&cfg.archive)?);
    Ok(ArchiveApi::new(archive, engine, cfg.query.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let ledger = Ledger::open(&cfg.ledger.path).await?;
            ledger.close().await;
            println!("Ledger initialized at {}.", cfg.ledger.path.display());
        }
        Commands::Index => {
            let ledger = Arc::new(Ledger::open(&cfg.ledger.path).await?);
            let archive = Arc::new(ArchiveStore::new(&cfg.archive)?);
            let engine = engine::create_engine(&cfg.engine)?;
            let pipeline = Pipeline::new(&cfg, archive, engine, ledger.clone());

            let report = pipeline.run().await?;
            ledger.close().await;

            println!("index");
            println!("  chats seen: {}", report.chats_seen);
            println!("  chats indexed: {}", report.chats_indexed);
            println!("  documents submitted: {}", report.documents_submitted);
            println!("  documents failed: {}", report.documents_failed);
            println!(
                "  positions: {} fast path, {} rebuilt",
                report.fast_paths, report.slow_paths
            );
            println!(
                "  files marked: {} ({} ledger commits)",
                report.files_marked, report.ledger_flushes
            );
            println!("  elapsed: {:.1}s", report.duration.as_secs_f64());
            if report.degraded {
                for err in &report.errors {
                    eprintln!("  error: {}", err);
                }
                bail!("indexing pass degraded: {} chat(s) failed", report.chats_failed);
            }
            println!("ok");
        }
        Commands::Chats => {
            let api = open_api(&cfg, engine::create_engine(&cfg.engine)?)?;
            let chats = api.chats().await?;
            for chat in chats.iter() {
                println!(
                    "{:<14} {:<8} {}{}",
                    chat.id,
                    chat.kind.as_str(),
                    chat.name,
                    if chat.is_archived { " (archived)" } else { "" }
                );
            }
        }
        Commands::Count { chat } => {
            let api = open_api(&cfg, engine::create_engine(&cfg.engine)?)?;
            println!("{}", api.count(&chat).await?);
        }
        Commands::Messages {
            chat,
            start,
            rows,
            thread,
            all,
        } => {
            let api = open_api(&cfg, engine::create_engine(&cfg.engine)?)?;
            let selector = if all {
                MessageSelector::All
            } else if let Some(ts) = thread {
                MessageSelector::Thread { ts }
            } else {
                let start = match start {
                    Some(start) => start,
                    None => initial_offset(api.count(&chat).await?, rows),
                };
                MessageSelector::Window { start, rows }
            };
            let messages = api.messages(&chat, selector).await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        Commands::Search { query, limit } => {
            let api = open_api(&cfg, engine::create_engine(&cfg.engine)?)?;
            let hits = api.search(&query, limit).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                let position = hit
                    .position
                    .map(|p| format!("#{}", p))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}. [{}] {} {} {}",
                    i + 1,
                    hit.chat_id,
                    position,
                    hit.user_name.as_deref().unwrap_or("unknown"),
                    hit.ts
                );
                println!("    {}", hit.text.replace('\n', " "));
                if !hit.highlight_phrases.is_empty() {
                    println!("    matched: {}", hit.highlight_phrases.join(", "));
                }
            }
        }
        Commands::Ping => {
            let engine = engine::create_engine(&cfg.engine)?;
            engine.ping().await?;
            println!("Engine reachable at {}.", cfg.engine.base_url());
        }
    }

    Ok(())
}
