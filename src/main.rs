//! # Pictor CLI (`pictor`)
//!
//! The `pictor` binary is the primary interface for the engine. It provides
//! commands for database initialization, image ingestion, the analysis
//! worker pool, backup synchronization, semantic search, and tag management.
//!
//! ## Usage
//!
//! ```bash
//! pictor --config ./config/pictor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pictor init` | Create the SQLite catalog and run schema migrations |
//! | `pictor ingest <paths>` | Store images and queue them for analysis |
//! | `pictor work` | Drain the analysis queue with the worker pool |
//! | `pictor sync` | Replicate pending objects to backup endpoints |
//! | `pictor reconcile` | Repair drift between catalog and endpoints |
//! | `pictor search "<query>"` | Semantic nearest-neighbor search |
//! | `pictor show <fingerprint>` | Print metadata, tags, and index status |
//! | `pictor get <fingerprint>` | Write the object bytes to a file |
//! | `pictor tag add/rm` | Manage user tags |
//! | `pictor reanalyze <fingerprint>` | Queue a fresh analysis |
//! | `pictor delete <fingerprint>` | Remove an image everywhere |
//! | `pictor status` | Task queue counts |
//! | `pictor health` | Per-endpoint replica state counts |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the catalog
//! pictor init --config ./config/pictor.toml
//!
//! # Ingest a directory of photos
//! pictor ingest ./photos/*.jpg
//!
//! # Run the analysis workers until the queue is drained
//! pictor work
//!
//! # Bring backups up to date
//! pictor sync
//!
//! # Find images semantically
//! pictor search "a dog on a beach" --limit 5 --tag dog
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pictor::config;
use pictor::engine::Engine;
use pictor::index::SearchFilters;
use pictor::models::TagSource;

/// Pictor CLI — a media ingestion and synchronization engine with
/// AI-powered retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pictor.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pictor",
    about = "Pictor — content-addressed image storage with AI tagging and semantic search",
    version,
    long_about = "Pictor stores images content-addressed across local and S3-compatible \
    endpoints, keeps backups eventually consistent, tags and describes every image with a \
    vision model, and serves semantic nearest-neighbor search from an in-process vector index."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/pictor.toml`. All endpoint, database, vision,
    /// and embedding settings are read from this file.
    #[arg(long, global = true, default_value = "./config/pictor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (images, replicas, tasks, tags, embeddings). Idempotent.
    Init,

    /// Store images and queue them for analysis.
    ///
    /// Each file is fingerprinted (SHA-256), written to the primary
    /// endpoint, and an analysis task is queued. Files whose bytes are
    /// already cataloged are reported as duplicates and skipped.
    Ingest {
        /// Image files to ingest.
        paths: Vec<PathBuf>,
    },

    /// Drain the analysis queue with the configured worker pool.
    ///
    /// Claims queued tasks, runs vision analysis and embedding, and
    /// commits tags, description, and index entry per image. Returns when
    /// no task is eligible; tasks waiting out a retry backoff are left
    /// for the next run.
    Work,

    /// Replicate pending objects to backup endpoints.
    ///
    /// One pass over due replica records. Failed attempts are retried
    /// with exponential backoff on subsequent passes.
    Sync,

    /// Repair drift between the catalog and what endpoints actually hold.
    ///
    /// Lists every endpoint, creates missing replica records, re-arms
    /// failed ones, and marks objects already present as synced. Orphan
    /// objects unknown to the catalog are logged and left in place.
    Reconcile,

    /// Semantic nearest-neighbor search.
    ///
    /// Embeds the query with the configured provider and ranks it against
    /// the vector index. Requires vision and embedding to be configured
    /// and at least one successful analysis.
    Search {
        /// The query text.
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Only return images with this exact MIME type (e.g. `image/png`).
        #[arg(long)]
        mime: Option<String>,

        /// Only return images carrying this tag.
        #[arg(long)]
        tag: Option<String>,
    },

    /// Print an image's metadata, tags, and index status.
    Show {
        /// Content fingerprint (hex SHA-256).
        fingerprint: String,
    },

    /// Write an object's bytes to a file.
    Get {
        /// Content fingerprint (hex SHA-256).
        fingerprint: String,

        /// Output path. Defaults to the fingerprint in the current directory.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Read from this endpoint only instead of primary-first fallback.
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Manage user tags.
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Queue a fresh analysis for an already-stored image.
    ///
    /// Replaces AI tags, description, and embedding on success. User tags
    /// are untouched.
    Reanalyze {
        /// Content fingerprint (hex SHA-256).
        fingerprint: String,
    },

    /// Remove an image from the index, the catalog, and every endpoint.
    Delete {
        /// Content fingerprint (hex SHA-256).
        fingerprint: String,
    },

    /// Show the status of one analysis task.
    Task {
        /// Task id.
        id: String,
    },

    /// Task queue counts per state.
    Status,

    /// Per-endpoint replica state counts.
    Health,
}

/// Tag management subcommands.
#[derive(Subcommand)]
enum TagAction {
    /// Attach a user tag to an image.
    Add {
        /// Content fingerprint (hex SHA-256).
        fingerprint: String,
        /// Tag label. Normalized to trimmed lowercase.
        label: String,
    },
    /// Remove a tag from an image.
    Rm {
        /// Content fingerprint (hex SHA-256).
        fingerprint: String,
        /// Tag label.
        label: String,
        /// Only remove the tag from this source (`ai` or `user`).
        /// Without it the label is removed regardless of source.
        #[arg(long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let engine = Engine::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            // Engine::open already ran migrations
            println!("Catalog initialized successfully.");
        }
        Commands::Ingest { paths } => {
            if paths.is_empty() {
                anyhow::bail!("no files given");
            }
            for path in paths {
                let bytes = std::fs::read(&path)?;
                match engine.ingest(&bytes).await {
                    Ok(outcome) if outcome.deduplicated => {
                        println!("{}  duplicate  {}", outcome.fingerprint, path.display());
                    }
                    Ok(outcome) => {
                        println!(
                            "{}  stored  {} ({}, {} bytes)",
                            outcome.fingerprint,
                            path.display(),
                            outcome.mime,
                            outcome.size_bytes
                        );
                    }
                    Err(e) => {
                        eprintln!("{}: {}", path.display(), e);
                    }
                }
            }
        }
        Commands::Work => {
            engine.run_workers().await?;
            let status = engine.queue_status().await?;
            println!(
                "Queue drained: {} succeeded, {} failed, {} awaiting retry.",
                status.succeeded, status.failed, status.failed_retryable
            );
        }
        Commands::Sync => {
            let report = engine.sync_pass().await?;
            println!(
                "Sync pass: {} synced, {} deferred, {} failed terminally.",
                report.synced, report.deferred, report.failed
            );
        }
        Commands::Reconcile => {
            let report = engine.reconcile().await?;
            println!("Reconciliation complete: {} replicas re-armed.", report.deferred);
        }
        Commands::Search {
            query,
            limit,
            mime,
            tag,
        } => {
            let filters = SearchFilters { mime, tag };
            let hits = engine.search_text(&query, limit, &filters).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{:2}. {:.4}  {}  {}",
                    i + 1,
                    hit.score,
                    hit.fingerprint,
                    hit.description.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Show { fingerprint } => {
            let detail = engine.image_detail(&fingerprint).await?;
            println!("fingerprint: {}", detail.image.fingerprint);
            println!("mime:        {}", detail.image.mime);
            println!("size:        {} bytes", detail.image.size_bytes);
            println!("indexed:     {}", detail.indexed);
            if let Some(desc) = &detail.image.description {
                println!("description: {}", desc);
            }
            for tag in &detail.tags {
                match tag.confidence {
                    Some(c) => println!("tag:         {} ({}, {:.2})", tag.label, tag.source, c),
                    None => println!("tag:         {} ({})", tag.label, tag.source),
                }
            }
        }
        Commands::Get {
            fingerprint,
            out,
            endpoint,
        } => {
            let bytes = engine.store().get(&fingerprint, endpoint.as_deref()).await?;
            let out = out.unwrap_or_else(|| PathBuf::from(&fingerprint));
            std::fs::write(&out, &bytes)?;
            println!("Wrote {} bytes to {}.", bytes.len(), out.display());
        }
        Commands::Tag { action } => match action {
            TagAction::Add { fingerprint, label } => {
                engine.add_tag(&fingerprint, &label).await?;
                println!("Tagged {} with '{}'.", fingerprint, label.trim().to_lowercase());
            }
            TagAction::Rm {
                fingerprint,
                label,
                source,
            } => {
                let source = match source.as_deref() {
                    Some(s) => Some(
                        TagSource::parse(s)
                            .ok_or_else(|| anyhow::anyhow!("source must be 'ai' or 'user'"))?,
                    ),
                    None => None,
                };
                engine.remove_tag(&fingerprint, &label, source).await?;
                println!("Removed '{}' from {}.", label.trim().to_lowercase(), fingerprint);
            }
        },
        Commands::Reanalyze { fingerprint } => {
            let task_id = engine.reanalyze(&fingerprint).await?;
            println!("Queued task {}.", task_id);
        }
        Commands::Delete { fingerprint } => {
            engine.delete(&fingerprint).await?;
            println!("Deleted {}.", fingerprint);
        }
        Commands::Task { id } => {
            let task = engine.task_status(&id).await?;
            println!("task:        {}", task.id);
            println!("fingerprint: {}", task.fingerprint);
            println!("state:       {}", task.state.as_str());
            println!("attempts:    {}", task.attempts);
            if let Some(err) = &task.last_error {
                println!("last error:  {}", err);
            }
        }
        Commands::Status => {
            let status = engine.queue_status().await?;
            println!("queued:           {}", status.queued);
            println!("in progress:      {}", status.in_progress);
            println!("succeeded:        {}", status.succeeded);
            println!("awaiting retry:   {}", status.failed_retryable);
            println!("failed:           {}", status.failed);
            println!("indexed vectors:  {}", engine.index_size());
        }
        Commands::Health => {
            let health = engine.storage_health().await?;
            for ep in health {
                println!(
                    "{:20} synced {:6}  pending {:6}  failed {:6}",
                    ep.endpoint, ep.synced, ep.pending, ep.failed
                );
            }
        }
    }

    Ok(())
}
