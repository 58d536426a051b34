//! Repository administration tool
//!
//! Runs maintenance tasks against a repository stored in a libsql database
//! file: binary garbage collection, hard deletion of soft-deleted
//! documents, and store statistics.
//!
//! # Usage
//!
//! ```bash
//! export DOCSPACE_DB=/var/lib/docspace/repo.db
//! export DOCSPACE_MODEL=/etc/docspace/model.json
//! export DOCSPACE_BINARIES=/var/lib/docspace/binaries   # for gc
//!
//! cargo run --bin docspace-admin -- gc [--dry-run]
//! cargo run --bin docspace-admin -- cleanup [--max N] [--older-than-hours H]
//! cargo run --bin docspace-admin -- stats
//! ```
//!
//! `--config` (or `DOCSPACE_CONFIG`) may point to a JSON repository
//! configuration; `--binaries` overrides the binaries path it contains.

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use docspace_core::{LibsqlRowStore, Model, Repository, RepositoryConfig, RowStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// docspace-admin: maintenance for DocSpace repositories
#[derive(Debug, Parser)]
#[command(name = "docspace-admin", version)]
struct Args {
    /// Repository database file
    #[arg(long, env = "DOCSPACE_DB")]
    db: PathBuf,

    /// Document model (JSON)
    #[arg(long, env = "DOCSPACE_MODEL")]
    model: PathBuf,

    /// Repository configuration (JSON)
    #[arg(long, env = "DOCSPACE_CONFIG")]
    config: Option<PathBuf>,

    /// Binary store directory
    #[arg(long, env = "DOCSPACE_BINARIES")]
    binaries: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Collect binaries no document references
    Gc {
        /// Report what would be collected without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Hard-delete soft-deleted documents
    Cleanup {
        /// Maximum number of documents to remove, 0 for no limit
        #[arg(long, default_value_t = 0)]
        max: usize,
        /// Only documents deleted at least this many hours ago
        #[arg(long)]
        older_than_hours: Option<i64>,
    },
    /// Print repository and store counters
    Stats,
}

async fn load_config(args: &Args) -> anyhow::Result<RepositoryConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {:?}", path))?;
            RepositoryConfig::from_json(&text)?
        }
        None => RepositoryConfig::default(),
    };
    if let Some(path) = &args.binaries {
        config.binaries_path = Some(path.clone());
    }
    Ok(config)
}

async fn open(args: &Args) -> anyhow::Result<(Repository, Arc<LibsqlRowStore>)> {
    let model_json = tokio::fs::read_to_string(&args.model)
        .await
        .with_context(|| format!("reading {:?}", args.model))?;
    let model = Arc::new(Model::from_json(&model_json)?);
    let config = load_config(args).await?;

    let store = Arc::new(LibsqlRowStore::open(args.db.clone()).await?);
    let repository = Repository::open(config, model, store.clone()).await?;
    Ok((repository, store))
}

async fn run_gc(repository: &Repository, dry_run: bool) -> anyhow::Result<()> {
    let gc = repository.binary_garbage_collector()?;
    gc.start()?;
    let marked = match repository.mark_referenced_binaries(&gc).await {
        Ok(marked) => marked,
        Err(e) => {
            // end the run so a later one can start
            gc.stop(false).await?;
            return Err(e.into());
        }
    };
    let status = gc.stop(!dry_run).await?;
    tracing::info!("binary GC marked {} digests", marked);
    println!(
        "{}",
        json!({
            "referenced": marked,
            "kept": status.num_binaries,
            "kept_bytes": status.size_binaries,
            "collected": status.num_binaries_gc,
            "collected_bytes": status.size_binaries_gc,
            "deleted": !dry_run,
        })
    );
    Ok(())
}

async fn run_cleanup(
    repository: &Repository,
    max: usize,
    older_than_hours: Option<i64>,
) -> anyhow::Result<()> {
    let before = older_than_hours.map(|hours| Utc::now() - Duration::hours(hours));
    let removed = repository.cleanup_deleted_documents(max, before).await?;
    println!("{}", json!({ "removed": removed }));
    Ok(())
}

fn print_stats(repository: &Repository, store: &LibsqlRowStore) {
    let stats = store.stats();
    println!(
        "{}",
        json!({
            "repository": repository.name(),
            "root": repository.root_id().as_str(),
            "store": store.name(),
            "selects": stats.selects,
            "inserted_rows": stats.inserted_rows,
            "updated_rows": stats.updated_rows,
            "deleted_rows": stats.deleted_rows,
        })
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("docspace_admin=info,docspace_core=info")
        .init();

    let args = Args::parse();
    let (repository, store) = open(&args).await?;
    let result = match args.command {
        Command::Gc { dry_run } => run_gc(&repository, dry_run).await,
        Command::Cleanup {
            max,
            older_than_hours,
        } => run_cleanup(&repository, max, older_than_hours).await,
        Command::Stats => {
            print_stats(&repository, &store);
            Ok(())
        }
    };
    repository.close().await?;
    result
}
