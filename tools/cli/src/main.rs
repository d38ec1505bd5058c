//! MinuteSync CLI - Command line interface for mirroring meeting notes.
//!
//! This tool syncs a remote meeting-notes collection into a local folder of
//! Markdown files and manages the sync state kept alongside it.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use minutesync_common::RemoteId;
use minutesync_storage::{FileStore, FileWatcher, HttpRemoteSource, LocalFileStore};
use minutesync_sync::{
    state_dir_for, EventPump, InitOutcome, PersistDebouncer, StateStore, SyncEngine, SyncMode,
    SyncOptions, SyncProgress, SyncReport, SyncScheduler,
};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "minutesync")]
#[command(about = "MinuteSync - Mirror meeting notes into Markdown")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file.
    Init {
        /// Mirror folder for synced notes.
        #[arg(short, long)]
        mirror: Option<PathBuf>,

        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },

    /// Run one sync.
    Sync {
        /// Fetch every item instead of only recent changes.
        #[arg(long)]
        full: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show sync state for the mirror.
    Status,

    /// Check the persisted state without repairing it.
    Verify,

    /// Forget tracked files that no longer exist.
    Cleanup,

    /// Allow a deleted item to be synced again.
    Untombstone {
        /// Remote item ID.
        id: String,
    },

    /// Sync periodically and track local file changes until Ctrl-C.
    Watch {
        /// Seconds between syncs.
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };

    let load = || AppConfig::load(&config_path);
    match cli.command {
        Commands::Init { mirror, force } => cmd_init(&config_path, mirror, force),
        Commands::Sync { full, json } => cmd_sync(&load()?, full, json).await,
        Commands::Status => cmd_status(&load()?).await,
        Commands::Verify => cmd_verify(&load()?).await,
        Commands::Cleanup => cmd_cleanup(&load()?).await,
        Commands::Untombstone { id } => cmd_untombstone(&load()?, &id).await,
        Commands::Watch { interval } => cmd_watch(&load()?, interval).await,
    }
}

/// Local mirror plus its loaded state store.
struct Mirror {
    files: Arc<dyn FileStore>,
    store: StateStore,
    outcome: InitOutcome,
}

async fn open_mirror(config: &AppConfig) -> Result<Mirror> {
    let files: Arc<dyn FileStore> = Arc::new(
        LocalFileStore::new(&config.mirror_root)
            .with_context(|| format!("Failed to open mirror {}", config.mirror_root.display()))?,
    );
    let mut store = StateStore::new(files.clone(), state_dir_for(&config.mirror_root))
        .with_frontmatter_key(config.sync.frontmatter_key.clone());
    let outcome = store.initialize().await;
    report_init(&outcome);
    Ok(Mirror {
        files,
        store,
        outcome,
    })
}

fn report_init(outcome: &InitOutcome) {
    match outcome {
        InitOutcome::Created | InitOutcome::Loaded => {}
        InitOutcome::Migrated { from } => info!("Sync state upgraded from version {}", from),
        InitOutcome::RestoredFromBackup => info!("Sync state restored from backup"),
        InitOutcome::Rebuilt { recovered } => {
            info!("Sync state rebuilt from mirror, {} files recovered", recovered)
        }
    }
}

fn build_engine(config: &AppConfig, mirror: Mirror, progress: bool) -> Result<SyncEngine> {
    let token = config.token()?;
    let remote = Arc::new(
        HttpRemoteSource::new(&config.api_base_url, token).context("Invalid API settings")?,
    );
    let store = Arc::new(RwLock::new(mirror.store));
    let engine = SyncEngine::new(remote, mirror.files, store, config.sync.clone());
    if !progress {
        return Ok(engine);
    }
    Ok(engine.with_progress(Arc::new(|p: &SyncProgress| {
        info!(
            "Processed {}/{} items (batch size {})",
            p.processed, p.total, p.batch_size
        );
    })))
}

fn print_report(report: &SyncReport) {
    let status = if report.success { "completed" } else { "failed" };
    println!("Sync {} in {} ms", status, report.duration_ms);
    println!("  Created: {}", report.created);
    println!("  Updated: {}", report.updated);
    println!("  Skipped: {}", report.skipped);
    if !report.errors.is_empty() {
        println!("  Errors:");
        for e in &report.errors {
            match (&e.item_id, &e.item_title) {
                (Some(id), Some(title)) => println!("    {} ({}): {}", title, id, e.message),
                (Some(id), None) => println!("    {}: {}", id, e.message),
                _ => println!("    {}", e.message),
            }
        }
    }
}

/// Write a default config.
fn cmd_init(path: &Path, mirror: Option<PathBuf>, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = AppConfig::default();
    if let Some(mirror) = mirror {
        config.mirror_root = mirror;
    }
    config.save(path)?;

    println!("Config written to {}", path.display());
    println!("  Mirror: {}", config.mirror_root.display());
    println!("  Token variable: {}", config.token_env);

    Ok(())
}

/// Run a single sync.
async fn cmd_sync(config: &AppConfig, full: bool, json: bool) -> Result<()> {
    let mirror = open_mirror(config).await?;
    let engine = build_engine(config, mirror, !json)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling after the current batch");
            on_interrupt.cancel();
        }
    });

    let report = engine
        .run(SyncOptions { full }, cancel)
        .await
        .context("Sync failed to start")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(&report);
    }

    if !report.success {
        anyhow::bail!("Sync finished with {} errors", report.errors.len());
    }
    Ok(())
}

/// Show state summary.
async fn cmd_status(config: &AppConfig) -> Result<()> {
    let mirror = open_mirror(config).await?;
    let state = mirror.store.state();

    println!("Mirror: {}", config.mirror_root.display());
    println!("  State version: {}", state.version);
    println!("  Tracked files: {}", state.files.len());
    println!("  Deleted items: {}", state.deleted_ids.len());
    match state.last_sync {
        Some(at) => println!("  Last sync: {}", at.to_rfc3339()),
        None => println!("  Last sync: never"),
    }
    println!("  Backups: {}", mirror.store.backups().len());
    if mirror.outcome != InitOutcome::Loaded {
        println!("  Startup: {:?}", mirror.outcome);
    }

    Ok(())
}

/// Inspect persisted state.
async fn cmd_verify(config: &AppConfig) -> Result<()> {
    let inspection = StateStore::inspect(state_dir_for(&config.mirror_root))
        .await
        .context("Failed to inspect sync state")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&inspection).context("Failed to serialize inspection")?
    );

    if let Some(problem) = inspection.problem {
        anyhow::bail!("Sync state is damaged: {}", problem);
    }
    Ok(())
}

/// Drop entries whose files are gone.
async fn cmd_cleanup(config: &AppConfig) -> Result<()> {
    let mut mirror = open_mirror(config).await?;
    let removed = mirror
        .store
        .cleanup_orphans()
        .await
        .context("Failed to clean up state")?;
    if removed > 0 {
        mirror.store.persist().await.context("Failed to save state")?;
    }

    println!("Removed {} orphaned entries", removed);
    Ok(())
}

/// Clear a deletion tombstone.
async fn cmd_untombstone(config: &AppConfig, id: &str) -> Result<()> {
    let remote_id = RemoteId::new(id).context("Invalid item ID")?;
    let mut mirror = open_mirror(config).await?;

    if !mirror.store.clear_tombstone(&remote_id) {
        anyhow::bail!("Item {} is not marked as deleted", id);
    }
    mirror.store.persist().await.context("Failed to save state")?;

    println!("Item {} will be synced again on the next run", id);
    Ok(())
}

/// Periodic sync with live file tracking.
async fn cmd_watch(config: &AppConfig, interval: u64) -> Result<()> {
    if interval == 0 {
        anyhow::bail!("Interval must be at least one second");
    }

    let mirror = open_mirror(config).await?;
    let engine = Arc::new(build_engine(config, mirror, false)?);
    let store = engine.store();

    let (watcher, events) =
        FileWatcher::start(&config.mirror_root).context("Failed to watch mirror")?;
    let debouncer = PersistDebouncer::spawn(store.clone(), config.sync.persist_debounce);
    let pump_shutdown = CancellationToken::new();
    let pump = tokio::spawn(
        EventPump::new(store, debouncer.handle()).run(events, pump_shutdown.clone()),
    );

    let (scheduler, handle) = SyncScheduler::new(
        SyncMode::Periodic {
            interval: Duration::from_secs(interval),
        },
        config.sync.queue_capacity,
    );
    let runner = tokio::spawn(handle.run(move |options, cancel| {
        let engine = engine.clone();
        async move { engine.run(options, cancel).await }
    }));

    info!(
        "Watching {} (sync every {}s), press Ctrl-C to stop",
        config.mirror_root.display(),
        interval
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    scheduler.shutdown();
    if let Err(e) = runner.await {
        error!("Scheduler task failed: {}", e);
    }
    drop(watcher);
    pump_shutdown.cancel();
    if let Err(e) = pump.await {
        error!("Event task failed: {}", e);
    }
    debouncer.shutdown().await;

    Ok(())
}
