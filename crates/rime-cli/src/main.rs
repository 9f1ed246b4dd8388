//! Rime: normalized entity cache inspector
//!
//! Main binary with subcommands:
//! - `id` / `query`: Print canonical cache keys
//! - `item` / `list`: Read through a branch until the data settles
//! - `sum`: Reduce a numeric attribute across a list
//! - `edit`: Commit attributes on a branch and report or apply the changes

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{EditMode, Session};

#[derive(Parser)]
#[command(name = "rime")]
#[command(about = "Normalized entity cache inspector", long_about = None)]
struct Cli {
    /// JSON fixture served by an in-memory transport
    #[arg(long, global = true, env = "RIME_FIXTURE")]
    fixture: Option<PathBuf>,

    /// Base URL of a REST backend (used when no fixture is given)
    #[arg(long, global = true, env = "RIME_BASE_URL")]
    base_url: Option<String>,

    /// Repository configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the item insert debounce window
    #[arg(long, global = true, env = "RIME_INSERT_DEBOUNCE_MS")]
    insert_debounce_ms: Option<u64>,

    /// How long to wait for fetches to settle
    #[arg(long, global = true, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical key of an id (JSON, or a bare string)
    Id { id: String },

    /// Print the canonical key of a list query (JSON)
    Query { query: String },

    /// Fetch one item
    Item {
        #[arg(long)]
        model: String,

        #[arg(long)]
        id: String,
    },

    /// Fetch a list and print its references and total count
    List {
        #[arg(long)]
        model: String,

        /// List query (JSON)
        #[arg(long, default_value = "{}")]
        query: String,
    },

    /// Sum a numeric attribute over a list
    Sum {
        #[arg(long)]
        model: String,

        /// List query (JSON)
        #[arg(long, default_value = "{}")]
        query: String,

        #[arg(long)]
        attribute: String,
    },

    /// Commit attributes to an item and print the pending changes
    Edit {
        #[arg(long)]
        model: String,

        #[arg(long)]
        id: String,

        /// Attributes to set (JSON object)
        #[arg(long)]
        set: String,

        /// Merge the changes into the repository (invalidates lists)
        #[arg(long, conflicts_with = "push")]
        merge: bool,

        /// Push the changes into the repository (keeps lists)
        #[arg(long)]
        push: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rime=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let output = run(cli).await?;
    println!("{}", output);
    Ok(())
}

async fn run(cli: Cli) -> Result<String> {
    let session = || -> Result<Session> {
        let transport = commands::load_transport(cli.fixture.as_deref(), cli.base_url.as_deref())?;
        let config = commands::load_config(cli.config.as_deref(), cli.insert_debounce_ms)?;
        Ok(Session::new(
            transport,
            config,
            Duration::from_millis(cli.timeout_ms),
        ))
    };

    match &cli.command {
        Commands::Id { id } => commands::id_key(id),
        Commands::Query { query } => commands::query_key(query),
        Commands::Item { model, id } => {
            let id = commands::parse_id(id)?;
            session()?.item(model, &id).await
        }
        Commands::List { model, query } => {
            let query = commands::parse_json(query, "query")?;
            session()?.list(model, query).await
        }
        Commands::Sum {
            model,
            query,
            attribute,
        } => {
            let query = commands::parse_json(query, "query")?;
            session()?.sum(model, query, attribute).await
        }
        Commands::Edit {
            model,
            id,
            set,
            merge,
            push,
        } => {
            let id = commands::parse_id(id)?;
            let attributes = match commands::parse_json(set, "attributes")? {
                serde_json::Value::Object(map) => map,
                other => return Err(miette::miette!("--set must be a JSON object, got {}", other)),
            };
            let mode = match (merge, push) {
                (true, _) => EditMode::Merge,
                (_, true) => EditMode::Push,
                _ => EditMode::Preview,
            };
            session()?.edit(model, &id, attributes, mode).await
        }
    }
}
