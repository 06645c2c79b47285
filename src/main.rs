//! # ZeRag CLI (`zerag`)
//!
//! ## Usage
//!
//! ```bash
//! zerag --config ./config/zerag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `zerag init` | Create the SQLite database and run schema migrations |
//! | `zerag serve` | Start the HTTP API |
//! | `zerag sources list` | List data sources with status and chunk counts |
//! | `zerag sources add <file.json>` | Create a data source from a JSON definition |
//! | `zerag sources remove <id>` | Delete a data source and its chunks |
//! | `zerag sources test <id>` | Check a data source is reachable |
//! | `zerag sync <id>` | Sync a data source in the foreground |
//! | `zerag status <id>` | Show sync status |
//! | `zerag chunks <id>` | Page through stored chunks |
//! | `zerag ask "<question>"` | Ask a question |
//!
//! ## Examples
//!
//! ```bash
//! zerag sources add ./shop-db.json
//! zerag sync 1
//! zerag ask "What is the refund policy?" --source 1 --stream
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use zerag::commands::{self, AskOptions};
use zerag::services::Services;
use zerag::{config, logging, migrate, server, sources};

/// Question answering over databases, documents and web pages.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/zerag.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "zerag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/zerag.toml")]
    config: PathBuf,

    /// Log filter, e.g. `debug` or `zerag=debug,sqlx=warn`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Manage data sources.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Sync a data source and wait for it to finish.
    ///
    /// Old chunks are deleted, every unit is fetched, chunked and
    /// embedded again. Exits non-zero when the sync ends in `error`.
    Sync { id: i64 },

    /// Show a data source's sync status.
    Status { id: i64 },

    /// List stored chunks of a data source.
    Chunks {
        id: i64,

        /// Only chunks containing this text (case-insensitive).
        #[arg(long)]
        q: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: i64,

        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },

    /// Ask a question.
    Ask {
        question: String,

        /// Restrict retrieval to one data source.
        #[arg(long)]
        source: Option<i64>,

        /// Plain chat, no retrieval.
        #[arg(long)]
        chat: bool,

        /// Print tokens as they arrive.
        #[arg(long)]
        stream: bool,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        no_rewrite: bool,

        #[arg(long)]
        no_hyde: bool,

        #[arg(long)]
        no_sql_fallback: bool,
    },
}

#[derive(Subcommand)]
enum SourcesAction {
    List,
    /// Create from a JSON file: `{"name", "kind", "connection", "chunk_strategy"}`.
    Add { file: PathBuf },
    Remove { id: i64 },
    Test { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref(), false)?;

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }
    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let services = Services::open(&cfg).await?;
    match cli.command {
        Commands::Init | Commands::Serve => {}
        Commands::Sources { action } => match action {
            SourcesAction::List => sources::list_sources(&services).await?,
            SourcesAction::Add { file } => sources::add_source(&services, &file).await?,
            SourcesAction::Remove { id } => sources::remove_source(&services, id).await?,
            SourcesAction::Test { id } => sources::test_source(&services, id).await?,
        },
        Commands::Sync { id } => commands::run_sync(&services, id).await?,
        Commands::Status { id } => commands::run_status(&services, id).await?,
        Commands::Chunks {
            id,
            q,
            page,
            page_size,
        } => commands::run_chunks(&services, id, q, page, page_size).await?,
        Commands::Ask {
            question,
            source,
            chat,
            stream,
            top_k,
            no_rewrite,
            no_hyde,
            no_sql_fallback,
        } => {
            let opts = AskOptions {
                source,
                chat,
                stream,
                top_k,
                no_rewrite,
                no_hyde,
                no_sql_fallback,
            };
            commands::run_ask(&services, &question, opts).await?
        }
    }

    Ok(())
}
