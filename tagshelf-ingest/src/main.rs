//! tagshelf-ingest - audio ingest service
//!
//! Subcommands:
//! - `scan`: scan a root into a new staging store, group albums and enqueue
//!   their `process` jobs
//! - `place`: enqueue placement of one staged album into a library
//! - `probe`: probe monitored paths and print their capacity status
//! - `serve`: run the capacity scheduler, worker groups and operator API
//! - `jobs`: inspect and manage the job queue

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::SqlitePool;
use tagshelf_common::config::RootFolderResolver;
use tagshelf_common::db::init::{init_catalog, max_lock_wait_ms};
use tagshelf_common::events::EventBus;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tagshelf_ingest::api::jobs::parse_states;
use tagshelf_ingest::config::IngestConfig;
use tagshelf_ingest::db::SqliteJobQueue;
use tagshelf_ingest::jobs::{
    spawn_worker_pool, HandlerRegistry, JobQueue, MoveHandler, PlacementGate, ProcessHandler,
};
use tagshelf_ingest::services::capacity_probe::{CapacityProbe, SysinfoSampler};
use tagshelf_ingest::services::ingest_pipeline::IngestPipeline;
use tagshelf_ingest::AppState;

/// Command-line arguments for tagshelf-ingest
#[derive(Parser, Debug)]
#[command(name = "tagshelf-ingest")]
#[command(about = "Audio ingest: scan, group, stage and place albums")]
#[command(version)]
struct Args {
    /// Configuration file (overrides TAGSHELF_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root data folder (overrides TAGSHELF_ROOT and the config file)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a directory tree and stage its albums
    Scan {
        /// Inbound directory to scan
        path: PathBuf,

        /// Library whose staging template applies
        #[arg(short, long)]
        library: Option<String>,
    },

    /// Enqueue placement of a staged album into a library
    Place {
        /// Staging store of the scan run
        staging_db: PathBuf,

        /// Album group id
        group_id: String,

        #[arg(short, long)]
        library: String,
    },

    /// Probe disk capacity (all monitored paths when none given)
    Probe { paths: Vec<PathBuf> },

    /// Run capacity scheduler, workers and the operator API
    Serve,

    /// Job queue operations
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand, Debug)]
enum JobsAction {
    /// List jobs, optionally filtered by comma-separated states
    List {
        #[arg(short, long)]
        state: Option<String>,
    },
    /// Cancel a pending or scheduled job
    Cancel { id: Uuid },
    /// Requeue a dead-lettered job
    Requeue { id: Uuid },
    /// Drop every dead-lettered job
    Purge,
}

/// Shared handles for every subcommand
struct Runtime {
    config: IngestConfig,
    root_folder: PathBuf,
    catalog: SqlitePool,
    event_bus: EventBus,
    queue: Arc<SqliteJobQueue>,
    capacity: Arc<CapacityProbe>,
}

impl Runtime {
    async fn bootstrap(args: &Args) -> Result<Self> {
        let config = IngestConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
        init_tracing(&config.bootstrap.logging.level);

        let root_folder = RootFolderResolver::new()
            .with_cli_arg(args.root.clone())
            .with_toml_value(config.bootstrap.root_folder.clone())
            .resolve();
        std::fs::create_dir_all(&root_folder)
            .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;

        let catalog_path = config.bootstrap.catalog_path(&root_folder);
        let catalog = init_catalog(&catalog_path)
            .await
            .with_context(|| format!("Failed to open catalog {}", catalog_path.display()))?;
        let lock_wait = max_lock_wait_ms(&catalog).await?;
        info!(root = %root_folder.display(), catalog = %catalog_path.display(), "Catalog ready");

        let event_bus = EventBus::new(256);
        let queue = Arc::new(
            SqliteJobQueue::new(catalog.clone(), config.jobs.retry.clone())
                .with_event_bus(event_bus.clone())
                .with_max_lock_wait_ms(lock_wait),
        );

        let capacity = CapacityProbe::new(config.capacity.clone(), Arc::new(SysinfoSampler))
            .with_catalog(catalog.clone())
            .with_event_bus(event_bus.clone());
        let restored = capacity.load_persisted().await?;
        if restored > 0 {
            info!(paths = restored, "Restored persisted capacity status");
        }

        Ok(Self {
            config,
            root_folder,
            catalog,
            event_bus,
            queue,
            capacity: Arc::new(capacity),
        })
    }

    fn pipeline(&self) -> Result<IngestPipeline> {
        let staging_folder = self.config.bootstrap.staging_folder(&self.root_folder);
        let pipeline = IngestPipeline::new(
            self.config.clone(),
            self.catalog.clone(),
            self.queue.clone(),
            PlacementGate::new(Arc::clone(&self.capacity)),
            staging_folder,
        )?
        .with_event_bus(self.event_bus.clone());
        Ok(pipeline)
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = Runtime::bootstrap(&args).await?;

    match &args.command {
        Command::Scan { path, library } => run_scan(&runtime, path, library.as_deref()).await,
        Command::Place {
            staging_db,
            group_id,
            library,
        } => {
            let library = runtime
                .config
                .library(library)
                .ok_or_else(|| anyhow!("Unknown library '{}'", library))?;
            // Placement decisions need a current sample
            runtime.capacity.probe_all().await;
            let placement = runtime
                .pipeline()?
                .place_album(staging_db, group_id, library)
                .await?;
            print_json(&placement)
        }
        Command::Probe { paths } => {
            let report = if paths.is_empty() {
                runtime.capacity.probe_all().await
            } else {
                runtime.capacity.probe_paths(paths).await
            };
            print_json(&report)
        }
        Command::Serve => serve(runtime).await,
        Command::Jobs { action } => run_jobs(&runtime, action).await,
    }
}

async fn run_scan(runtime: &Runtime, path: &std::path::Path, library: Option<&str>) -> Result<()> {
    let library = match library {
        Some(name) => Some(
            runtime
                .config
                .library(name)
                .ok_or_else(|| anyhow!("Unknown library '{}'", name))?,
        ),
        None => None,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let report = runtime.pipeline()?.run(path, library, cancel).await?;
    print_json(&report)
}

async fn run_jobs(runtime: &Runtime, action: &JobsAction) -> Result<()> {
    let queue = &runtime.queue;
    match action {
        JobsAction::List { state } => {
            let states = parse_states(state.as_deref()).map_err(|e| anyhow!("{}", e))?;
            print_json(&queue.list(&states).await?)
        }
        JobsAction::Cancel { id } => {
            queue.cancel(*id).await?;
            println!("cancelled {}", id);
            Ok(())
        }
        JobsAction::Requeue { id } => print_json(&queue.requeue_dead_letter(*id).await?),
        JobsAction::Purge => {
            let purged = queue.purge_dead_letter().await?;
            println!("purged {} dead-lettered job(s)", purged);
            Ok(())
        }
    }
}

async fn serve(runtime: Runtime) -> Result<()> {
    let cancel = CancellationToken::new();
    let jobs = &runtime.config.jobs;

    let recovered = runtime
        .queue
        .recover_stale(Duration::from_secs(jobs.stale_after_secs))
        .await?;
    if recovered > 0 {
        warn!(recovered, "Returned stale active jobs to the queue");
    }

    let scheduler = Arc::clone(&runtime.capacity).spawn_scheduler(cancel.clone());

    let handlers = HandlerRegistry::new()
        .register(Arc::new(ProcessHandler))
        .register(Arc::new(MoveHandler::new(PlacementGate::new(Arc::clone(
            &runtime.capacity,
        )))));
    let workers = spawn_worker_pool(
        &jobs.workers,
        runtime.queue.clone(),
        Arc::new(handlers),
        Duration::from_millis(jobs.poll_interval_ms),
        cancel.clone(),
    );

    let state = AppState::new(
        runtime.catalog.clone(),
        runtime.queue.clone(),
        Arc::clone(&runtime.capacity),
        runtime.event_bus.clone(),
    );
    let app = tagshelf_ingest::build_router(state);

    let bind_address = &runtime.config.bootstrap.server.bind_address;
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;
    info!("Operator API listening on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cancel.cancel();
    for handle in workers {
        let _ = handle.await;
    }
    let _ = scheduler.await;
    runtime.catalog.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
