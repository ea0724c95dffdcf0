//! # Document Search CLI (`docsearch`)
//!
//! The `docsearch` binary manages the document search service: database
//! initialization, the HTTP API server, and manual re-ingestion of
//! individual documents.
//!
//! ## Usage
//!
//! ```bash
//! docsearch --config ./config/docsearch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsearch init` | Create the SQLite database and run schema migrations |
//! | `docsearch serve` | Start the HTTP API and background ingestion workers |
//! | `docsearch ingest <document-id>` | Re-run ingestion for one document |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! docsearch init --config ./config/docsearch.toml
//!
//! # Start the API server
//! docsearch serve --config ./config/docsearch.toml
//!
//! # Re-ingest a document that ended in an error state
//! docsearch ingest 7a1f0c9e-3d9b-4f8e-9a44-2f41c7c9ab10
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use doc_search::config;
use doc_search::db;
use doc_search::embedding::ProviderEmbedder;
use doc_search::extract::RemoteExtractor;
use doc_search::ingest::{self, IngestContext};
use doc_search::migrate;
use doc_search::server;

/// Document search service CLI.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docsearch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docsearch",
    about = "Document ingestion and retrieval-augmented search service",
    version,
    long_about = "Accepts user-uploaded documents, extracts and chunks their text, embeds the \
    chunks into a vector store, and answers search queries against them with optional \
    LLM-generated answers. Per-query token usage is recorded for billing."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP API server and background ingestion workers.
    Serve,

    /// Run ingestion for a single document, synchronously.
    ///
    /// Bypasses the job queue. Useful for re-processing a document that
    /// ended in an error state, or for debugging extraction issues.
    Ingest {
        /// UUID of the document to ingest.
        document_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { document_id } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let ctx = IngestContext {
                blobs: doc_search::blob::BlobStore::new(&cfg.blobs.root),
                extractor: Arc::new(RemoteExtractor::new(&cfg.extraction)?),
                embedder: Arc::new(ProviderEmbedder::new()?),
                store: server::build_store(&cfg)?,
            };
            ingest::run_ingestion(&pool, &ctx, &document_id).await?;
            println!("Document {} ingested.", document_id);
        }
    }

    Ok(())
}
