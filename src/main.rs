//! # vault-sync CLI (`vsync`)
//!
//! ## Usage
//!
//! ```bash
//! vsync --config ./config/vsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vsync health` | Report whether the index service is available |
//! | `vsync sync` | Reconcile the index with the vault tree |
//! | `vsync sync --dry-run` | Print what a sync would create and delete |
//! | `vsync search "<query>"` | Semantic search over indexed notes |
//! | `vsync reset` | Delete and re-provision the index |
//! | `vsync watch` | Sync, follow file events and re-sync periodically until Ctrl-C |
//!
//! Every command except `health` waits for the index to report healthy
//! before touching it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vault_sync::config::{self, Config};
use vault_sync::embedding::{Embedder, EmbeddingsClient};
use vault_sync::index::meili::MeiliIndex;
use vault_sync::index::SearchIndex;
use vault_sync::listener::EventListener;
use vault_sync::models::FileDescriptor;
use vault_sync::retry::{retry_until, ScheduledTask};
use vault_sync::search;
use vault_sync::sync::{SyncEngine, SyncSettings};
use vault_sync::vault;
use vault_sync::watcher::VaultWatcher;

/// vault-sync: keep a search index in sync with a folder of markdown notes.
#[derive(Parser)]
#[command(name = "vsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check once whether the index service is available.
    Health,

    /// Reconcile the index with the vault tree.
    Sync {
        /// Only print the paths that would be created and deleted.
        #[arg(long)]
        dry_run: bool,
    },

    /// Semantic search over indexed notes.
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Delete the index and provision it again. A later `sync` refills it.
    Reset,

    /// Run a sync, apply file events as they happen (modifications debounced
    /// by `sync.debounce_secs`) and re-sync every `sync.resync_interval_secs`.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vault_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingsClient::new(&cfg.embedding)?);
    let index: Arc<dyn SearchIndex> = Arc::new(MeiliIndex::new(
        &cfg.index,
        cfg.embedding.size,
        Arc::clone(&embedder),
    )?);
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&index),
        embedder,
        SyncSettings::from_config(&cfg),
    ));

    match cli.command {
        Commands::Health => {
            if engine.healthy().await {
                println!("Index at {} is available.", cfg.index.host);
            } else {
                println!("Index at {} is unavailable.", cfg.index.host);
                std::process::exit(1);
            }
        }
        Commands::Sync { dry_run } => {
            wait_until_healthy(&engine, &cfg).await?;
            let files = scan(&cfg).await?;
            if dry_run {
                let delta = engine.plan(&files).await?;
                println!("Dry run: {} files in vault", files.len());
                for file in &delta.to_create {
                    println!("  + {}", file.path);
                }
                for file in &delta.to_delete {
                    println!("  - {}", file.path);
                }
                println!(
                    "{} to create, {} to delete",
                    delta.to_create.len(),
                    delta.to_delete.len()
                );
            } else {
                engine.create_index().await?;
                let report = engine.spawn_sync(files).wait().await?;
                println!("sync complete");
                println!("  files: {}", report.files);
                println!("  missing: {}", report.missing);
                println!("  created: {}", report.created);
                println!("  chunks: {}", report.chunks);
                if !report.failed.is_empty() {
                    println!("  failed: {}", report.failed.len());
                    for path in &report.failed {
                        println!("    {}", path);
                    }
                }
            }
        }
        Commands::Search { query, limit } => {
            wait_until_healthy(&engine, &cfg).await?;
            search::run_search(index.as_ref(), &query, limit).await?;
        }
        Commands::Reset => {
            wait_until_healthy(&engine, &cfg).await?;
            engine.reset_index().await?;
            println!("Index '{}' reset.", cfg.index.uid);
        }
        Commands::Watch => {
            wait_until_healthy(&engine, &cfg).await?;
            engine.create_index().await?;
            watch(engine, cfg).await?;
        }
    }

    Ok(())
}

async fn wait_until_healthy(engine: &SyncEngine, cfg: &Config) -> Result<()> {
    info!(host = %cfg.index.host, "waiting for index to become available");
    retry_until(
        move || async move { Ok::<_, anyhow::Error>(engine.healthy().await) },
        cfg.sync.health_interval(),
    )
    .await?;
    Ok(())
}

async fn scan(cfg: &Config) -> Result<Vec<FileDescriptor>> {
    let vault = cfg.vault.clone();
    tokio::task::spawn_blocking(move || vault::scan_vault(&vault))
        .await
        .context("vault scan did not complete")?
}

async fn watch(engine: Arc<SyncEngine>, cfg: Config) -> Result<()> {
    let interval = cfg.sync.resync_interval();
    let cfg = Arc::new(cfg);
    let mut status = engine.status().subscribe();

    let task = {
        let engine = Arc::clone(&engine);
        let cfg = Arc::clone(&cfg);
        ScheduledTask::start(interval, move || {
            let engine = Arc::clone(&engine);
            let cfg = Arc::clone(&cfg);
            async move {
                if !engine.healthy().await {
                    warn!("index unavailable, skipping pass");
                    engine.status().failed("index unavailable");
                    return;
                }
                match scan(&cfg).await {
                    Ok(files) => {
                        if let Err(e) = engine.sync(&files).await {
                            warn!("sync pass failed: {:#}", e);
                        }
                    }
                    Err(e) => {
                        warn!("vault scan failed: {:#}", e);
                        engine.status().failed(format!("{:#}", e));
                    }
                }
            }
        })
    };

    let (events_tx, events_rx) = mpsc::channel(256);
    let watcher = VaultWatcher::start(&cfg.vault, events_tx)?;
    let listener = EventListener::new(Arc::clone(&engine), cfg.sync.debounce());
    let listening = tokio::spawn(listener.run(events_rx));

    println!(
        "Watching {} (re-sync every {}s). Press Ctrl-C to stop.",
        cfg.vault.root.display(),
        interval.as_secs()
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("status: {}", *status.borrow());
            }
        }
    }

    drop(watcher);
    listening.abort();
    task.cancel();
    println!("Stopped.");
    Ok(())
}
