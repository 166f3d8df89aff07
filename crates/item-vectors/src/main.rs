//! # item-vectors CLI (`ivec`)
//!
//! Admin surface over the configured storage backend. Every command prints
//! JSON on stdout; logs go to stderr.
//!
//! ```bash
//! ivec --config ./config/ivec.toml init
//! ivec group create ./groups/textbook-v1.toml
//! ivec group status 3f2504e0-4f89-11d3-9a0c-0305e82c3301
//! ivec search --group 3f2504e0-... --item book-42 --vector "[0.1, 0.2, ...]" --top-k 5
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use item_vectors::backend::open_storage;
use item_vectors::commands::{self, SearchArgs};
use item_vectors::config::load_config;

/// Chunk and embedding storage administration.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ivec.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ivec",
    about = "Chunk and embedding storage over PostgreSQL/pgvector and Elasticsearch",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ivec.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables, extensions and indices. Idempotent.
    Init,

    /// Manage chunk-embed groups.
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Inspect or remove the chunks of an item.
    Chunks {
        #[command(subcommand)]
        action: ChunksAction,
    },

    /// Nearest-neighbour search within one group.
    Search {
        /// Group to search in.
        #[arg(long)]
        group: String,

        /// Restrict to these items; repeat the flag for several. Omit to
        /// search every item in the group.
        #[arg(long = "item")]
        items: Vec<String>,

        /// Query vector, as a JSON array or comma-separated list.
        #[arg(long)]
        vector: String,

        #[arg(long, default_value_t = 10)]
        top_k: usize,

        /// Minimum cosine similarity.
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        threshold: f64,

        /// Only chunks whose `metadata.chunk_type` equals this value.
        #[arg(long)]
        chunk_type: Option<String>,

        /// Print only the single best match (fails if there is none).
        #[arg(long)]
        best: bool,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Create a group from a TOML definition file.
    Create { file: PathBuf },
    /// List groups, optionally only those holding chunks of an item.
    List {
        #[arg(long)]
        item: Option<String>,
    },
    /// Show a group and its chunk count.
    Show { id: String },
    /// Print a group's status (`FAILED` for unknown groups).
    Status { id: String },
    /// Delete a group and all of its chunks.
    Delete { id: String },
}

#[derive(Subcommand)]
enum ChunksAction {
    /// List every chunk of an item across groups.
    List { item: String },
    /// Delete every chunk of an item across groups.
    DeleteItem { item: String },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    let store = open_storage(&cfg).await?;
    let store = store.as_ref();

    let output = match cli.command {
        Commands::Init => serde_json::json!({
            "initialized": true,
            "backend": cfg.storage.backend.as_str(),
        }),
        Commands::Group { action } => match action {
            GroupAction::Create { file } => commands::create_group(store, &file).await?,
            GroupAction::List { item } => commands::list_groups(store, item.as_deref()).await?,
            GroupAction::Show { id } => commands::show_group(store, &id).await?,
            GroupAction::Status { id } => commands::group_status(store, &id).await?,
            GroupAction::Delete { id } => commands::delete_group(store, &id).await?,
        },
        Commands::Chunks { action } => match action {
            ChunksAction::List { item } => commands::list_chunks(store, &item).await?,
            ChunksAction::DeleteItem { item } => commands::delete_item_chunks(store, &item).await?,
        },
        Commands::Search {
            group,
            items,
            vector,
            top_k,
            threshold,
            chunk_type,
            best,
        } => {
            let args = SearchArgs {
                group_id: group,
                item_ids: items,
                vector: commands::parse_vector(&vector)?,
                top_k,
                threshold,
                chunk_type,
                best,
            };
            commands::search(store, args).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
