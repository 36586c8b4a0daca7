// Taskflow CLI
//
// Decision: use clap derive for argument parsing with env fallbacks
// Decision: schema migration failures at startup are fatal (non-zero exit);
//           everything after that flows through taskflow_events
// Decision: SIGTERM/ctrl-c finish the in-flight tick, then exit 0

mod manifest;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskflow_core::clock::SystemClock;
use taskflow_engine::{PushWorkerSet, Pusher, PusherConfig, Scheduler, SchedulerConfig};
use taskflow_storage::{PostgresTaskflowStore, TaskflowStore, MIGRATOR};

#[derive(Parser)]
#[command(name = "taskflow", about = "Workflow scheduler and dispatch engine", version)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// YAML manifest declaring workflows and standalone tasks
    #[arg(long, env = "TASKFLOW_MANIFEST")]
    manifest: PathBuf,

    /// Default log filter (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow scheduling loop
    Scheduler {
        /// Seconds between ticks
        #[arg(long, default_value_t = 5)]
        tick: u64,
    },

    /// Run the task dispatch loop
    Pusher {
        /// Seconds between ticks
        #[arg(long, default_value_t = 2)]
        tick: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = PostgresTaskflowStore::connect(&cli.database_url)
        .await
        .context("failed to connect to the store")?;
    MIGRATOR
        .run(store.pool())
        .await
        .context("schema migration failed")?;
    tracing::info!("store connection established, schema up to date");

    let manifest = manifest::Manifest::load(&cli.manifest)
        .with_context(|| format!("failed to load manifest {}", cli.manifest.display()))?;
    let registry = Arc::new(manifest.into_registry()?);

    let store: Arc<dyn TaskflowStore> = Arc::new(store);
    for workflow in registry.workflows() {
        store.upsert_workflow(&workflow).await?;
        for task in workflow.tasks() {
            store.upsert_task(task).await?;
        }
    }
    for task in registry.standalone_tasks() {
        store.upsert_task(&task).await?;
    }
    tracing::info!(
        workflows = registry.workflows().len(),
        standalone_tasks = registry.standalone_tasks().len(),
        "definitions registered"
    );

    let clock = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received; finishing current tick");
        let _ = shutdown_tx.send(true);
    });

    match cli.command {
        Commands::Scheduler { tick } => {
            let config = SchedulerConfig::default().with_tick_interval(Duration::from_secs(tick));
            Scheduler::new(store, registry, clock, config)
                .run(shutdown_rx)
                .await;
        }
        Commands::Pusher { tick } => {
            let config = PusherConfig::default().with_tick_interval(Duration::from_secs(tick));
            // concrete PushWorker transports are wired in by embedding
            // deployments; the bare binary reconciles nothing until then
            Pusher::new(store, registry, PushWorkerSet::new(), clock, config)
                .run(shutdown_rx)
                .await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
