//! # Dedupe Harness CLI (`dedupe`)
//!
//! The `dedupe` binary drives ingestion, scans, merges, and undo for one
//! organization at a time, and starts the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! dedupe --config ./config/dedupe.toml --org <org> <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dedupe init` | Create the SQLite database schema |
//! | `dedupe ingest` | Pull pages from the content source |
//! | `dedupe scan` | Embed documents and find duplicate pairs |
//! | `dedupe duplicates` | List pending duplicate pairs |
//! | `dedupe resolve <pair-id>` | Mark a pair resolved |
//! | `dedupe merge <kept> <removed> --content-file <f>` | Merge two documents |
//! | `dedupe validate-undo <merge-id>` | Check whether a merge can be undone |
//! | `dedupe undo <merge-id>` | Undo a merge |
//! | `dedupe history` | Merge history, newest first |
//! | `dedupe clear` | Drop the organization's corpus and pair cache |
//! | `dedupe serve` | Start the HTTP API |
//!
//! Logs go to stderr (`RUST_LOG` overrides `[logging].level`); command
//! output goes to stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dedupe_harness::config::{self, Config};
use dedupe_harness::migrate;
use dedupe_harness::progress::{format_number, ProgressMode};
use dedupe_harness::scan::ScanOptions;
use dedupe_harness::server;
use dedupe_harness::service::DedupeService;

/// Dedupe Harness: near-duplicate detection and reversible merges.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dedupe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dedupe",
    about = "Dedupe Harness: near-duplicate detection and reversible merges for document corpora",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dedupe.toml")]
    config: PathBuf,

    /// Organization to operate on.
    #[arg(long, global = true, default_value = "default")]
    org: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Pull every page from the configured content source into the corpus.
    Ingest,

    /// Embed missing documents, find duplicate pairs, rebuild the pair cache.
    Scan {
        /// Similarity threshold in [0, 1]; defaults to `[detection].similarity_threshold`.
        #[arg(long)]
        threshold: Option<f32>,

        /// Rewrite every document, not only those whose relationships changed.
        #[arg(long)]
        update_existing: bool,

        /// Progress output on stderr: `human`, `json`, or `off`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// List pending duplicate pairs.
    Duplicates {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Mark a duplicate pair resolved.
    Resolve { pair_id: u64 },

    /// Merge `removed` into `kept` (document ids).
    Merge {
        kept: String,
        removed: String,

        /// File holding the merged content written to the kept page.
        #[arg(long)]
        content_file: PathBuf,

        /// Exit non-zero when bookkeeping after the merge left warnings.
        #[arg(long)]
        strict: bool,
    },

    /// Check whether a merge may be undone now.
    ValidateUndo { merge_id: String },

    /// Undo a merge.
    Undo {
        merge_id: String,

        /// Exit non-zero when bookkeeping after the restore left warnings.
        #[arg(long)]
        strict: bool,
    },

    /// Show merge history, newest first.
    History,

    /// Drop the organization's corpus and pair cache.
    Clear,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);
    let org = cli.org.as_str();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        command => {
            let service = DedupeService::from_config(&cfg).await?;
            run_command(&service, org, command).await?;
        }
    }

    Ok(())
}

async fn run_command(service: &DedupeService, org: &str, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Ingest => {
            let report = service.ingest(org).await?;
            println!("ingest {}", org);
            println!("  pages: {}", format_number(report.pages_seen as u64));
            println!("  inserted: {}", report.inserted);
            println!("  updated: {}", report.updated);
            println!("  unchanged: {}", report.unchanged);
            println!("ok");
        }
        Commands::Scan {
            threshold,
            update_existing,
            progress,
        } => {
            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(s) => ProgressMode::parse(s)
                    .with_context(|| format!("unknown progress mode '{}'", s))?,
            };
            let reporter = mode.reporter();
            let handle = service.spawn_scan(
                org,
                ScanOptions {
                    threshold,
                    update_existing,
                },
            );
            let mut rx = handle.subscribe();
            loop {
                let status = rx.borrow_and_update().clone();
                reporter.report(org, &status);
                if status.phase.is_finished() || rx.changed().await.is_err() {
                    break;
                }
            }
            let report = handle.wait().await?;
            println!("scan {}", org);
            println!("  threshold: {}", report.threshold);
            println!("  documents: {}", format_number(report.documents_total as u64));
            println!("  embedded: {}", report.documents_embedded);
            if report.embedding_failures > 0 {
                println!("  embedding failures: {}", report.embedding_failures);
            }
            println!("  pairs found: {}", report.pairs_found);
            println!("  documents updated: {}", report.documents_updated);
            println!("ok");
        }
        Commands::Duplicates { json } => {
            let pairs = service.list_duplicates(org).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pairs)?);
            } else if pairs.is_empty() {
                println!("No pending duplicates.");
            } else {
                for p in &pairs {
                    println!(
                        "#{:<4} {:.3}  {}  <->  {}",
                        p.id, p.similarity, p.doc_a.title, p.doc_b.title
                    );
                    println!("        {}  {}", p.doc_a.document_id, p.doc_b.document_id);
                }
            }
        }
        Commands::Resolve { pair_id } => {
            if service.resolve_pair(org, pair_id).await? {
                println!("Pair {} resolved.", pair_id);
            } else {
                println!("Pair {} was not pending (unknown or already resolved).", pair_id);
            }
        }
        Commands::Merge {
            kept,
            removed,
            content_file,
            strict,
        } => {
            let merged = std::fs::read_to_string(&content_file)
                .with_context(|| format!("Failed to read {}", content_file.display()))?;
            let outcome = service.apply_merge(org, &kept, &removed, &merged).await?;
            println!("{}", outcome.message);
            if let Some(ref op) = outcome.operation {
                println!("  merge id: {}", op.id);
            }
            for w in &outcome.warnings {
                eprintln!("warning: {}", w);
            }
            if !outcome.success {
                anyhow::bail!("merge refused");
            }
            if strict {
                outcome.ensure_complete()?;
            }
        }
        Commands::ValidateUndo { merge_id } => {
            let check = service.validate_undo(org, &merge_id).await?;
            if check.can_undo {
                println!("Merge {} can be undone.", merge_id);
            } else {
                println!(
                    "{}",
                    check.reason.as_deref().unwrap_or("Merge cannot be undone yet.")
                );
                for op in &check.required_undos {
                    println!("  blocked by {} ({})", op.id, op.timestamp.to_rfc3339());
                }
            }
        }
        Commands::Undo { merge_id, strict } => {
            let outcome = service.undo(org, &merge_id).await?;
            println!("{}", outcome.message);
            if let Some(ref next) = outcome.next_required_undo {
                println!("  undo {} first", next.id);
            }
            if let Some(n) = outcome.pairs_found {
                println!("  pairs found after rescan: {}", n);
            }
            for w in &outcome.warnings {
                eprintln!("warning: {}", w);
            }
            if !outcome.success {
                anyhow::bail!("undo refused");
            }
            if strict {
                outcome.ensure_complete()?;
            }
        }
        Commands::History => {
            let ops = service.merge_history(org).await?;
            if ops.is_empty() {
                println!("No merges.");
            }
            for op in &ops {
                println!(
                    "{}  {}  {:<9}  {} <- {}",
                    op.timestamp.to_rfc3339(),
                    op.id,
                    op.status.to_string(),
                    op.kept.title,
                    op.removed.title
                );
            }
        }
        Commands::Clear => {
            let report = service.clear(org).await?;
            println!("Removed {} documents.", report.documents_removed);
        }
        Commands::Init | Commands::Serve => {}
    }
    Ok(())
}
