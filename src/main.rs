//! # Sitebrain CLI
//!
//! The `sitebrain` binary runs the HTTP API and provides maintenance
//! commands for operating a deployment.
//!
//! ## Usage
//!
//! ```bash
//! sitebrain --config ./config/sitebrain.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sitebrain init` | Create the SQLite database and run schema migrations |
//! | `sitebrain serve` | Start the HTTP API server |
//! | `sitebrain ingest <site_id> <file>` | Ingest a local file into a site |
//! | `sitebrain ask <site_id> "<message>"` | Run one chat turn from the terminal |
//! | `sitebrain reembed <document_id>` | Re-chunk and re-embed a failed document |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! sitebrain init --config ./config/sitebrain.toml
//!
//! # Ingest a handbook into a site
//! sitebrain ingest 7f2c41b8 ./docs/handbook.md
//!
//! # Ask a question the way the widget would
//! sitebrain ask 7f2c41b8 "What are your opening hours?"
//!
//! # Recover a document stuck in error after a provider outage
//! sitebrain reembed 5d89ca7e
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sitebrain::chat::{answer_turn, WidgetRequest};
use sitebrain::completion::CompletionClient;
use sitebrain::config::load_config;
use sitebrain::embedding::EmbeddingClient;
use sitebrain::extract::extract_text;
use sitebrain::ingest::{ingest_document, reembed_document, NewDocument};
use sitebrain::server::run_server;
use sitebrain::{db, migrate};

/// Sitebrain — a multi-tenant RAG backend for embeddable knowledge-base
/// chat widgets.
#[derive(Parser)]
#[command(
    name = "sitebrain",
    about = "Sitebrain — RAG backend for embeddable knowledge-base chat widgets",
    version,
    long_about = "Sitebrain ingests a site's documents (chunking and embedding them into a \
    site-scoped vector store) and answers visitor questions over HTTP by retrieving the \
    closest chunks and completing against an LLM provider with ordered model fallback."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sitebrain.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables.
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP API server on the configured bind address.
    Serve,

    /// Ingest a local file into a site's knowledge base.
    ///
    /// Supported formats: .txt, .md, .pdf. The file is chunked,
    /// embedded, and stored; the command reports the resulting document
    /// id, status, and chunk count.
    Ingest {
        /// The owning site id.
        site_id: String,

        /// Path to the file to ingest.
        file: PathBuf,

        /// Document title; defaults to the file name.
        #[arg(long)]
        title: Option<String>,
    },

    /// Run one chat turn against a site, the way the widget would.
    Ask {
        /// The site to query.
        site_id: String,

        /// The visitor message.
        message: String,

        /// Continue an existing chat session.
        #[arg(long)]
        session: Option<String>,
    },

    /// Re-chunk and re-embed an existing document.
    ///
    /// Uses the retrying batch embedder; intended for documents stuck
    /// in `error` after an embedding-provider outage.
    Reembed {
        /// The document id to re-process.
        document_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sitebrain=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }

        Commands::Serve => {
            run_server(&config).await?;
        }

        Commands::Ingest {
            site_id,
            file,
            title,
        } => {
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_string())
                .unwrap_or_else(|| file.display().to_string());
            let bytes = std::fs::read(&file)?;
            let content = extract_text(&bytes, &filename)?;
            if content.trim().is_empty() {
                bail!("file is empty or no text could be extracted");
            }

            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            let embedder = EmbeddingClient::new(&config.embedding)?;

            let outcome = ingest_document(
                &pool,
                &config,
                &embedder,
                NewDocument {
                    site_id,
                    title: title.unwrap_or_else(|| filename.clone()),
                    content,
                    source_url: Some(format!("file://{}", file.display())),
                },
            )
            .await?;

            println!("ingest {}", filename);
            println!("  document: {}", outcome.document_id);
            println!("  status: {}", outcome.status.as_str());
            println!("  chunks: {}", outcome.chunk_count);
            println!("  chars: {}", outcome.char_count);
            println!("ok");
            pool.close().await;
        }

        Commands::Ask {
            site_id,
            message,
            session,
        } => {
            let pool = db::connect(&config).await?;
            let embedder = EmbeddingClient::new(&config.embedding)?;
            let completion = CompletionClient::shared(&config.completion)?;

            let response = answer_turn(
                &pool,
                &config,
                &embedder,
                &completion,
                WidgetRequest {
                    site_id,
                    session_id: session,
                    message,
                    visitor_id: Some("cli".to_string()),
                },
            )
            .await?;

            println!("{}", response.answer);
            if !response.sources.is_empty() {
                println!();
                println!("--- Sources ({}) ---", response.sources.len());
                for source in &response.sources {
                    println!(
                        "[{:.2}] {}: \"{}\"",
                        source.similarity,
                        source.document_title,
                        source.content.replace('\n', " ")
                    );
                }
            }
            println!();
            println!("session: {}", response.session_id);
            pool.close().await;
        }

        Commands::Reembed { document_id } => {
            let pool = db::connect(&config).await?;
            let embedder = EmbeddingClient::new(&config.embedding)?;

            let outcome = reembed_document(&pool, &config, &embedder, &document_id).await?;
            println!("reembed {}", document_id);
            println!("  status: {}", outcome.status.as_str());
            println!("  chunks: {}", outcome.chunk_count);
            println!("ok");
            pool.close().await;
        }
    }

    Ok(())
}
