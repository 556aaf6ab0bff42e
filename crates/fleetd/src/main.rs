//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles all FleetGrid subsystems:
//! - State store (redb)
//! - Device registry + resource ledger
//! - Workload scheduler
//!
//! # Usage
//!
//! ```text
//! fleetd standalone --data-dir /var/lib/fleetgrid
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_registry::{CapabilityHub, DeviceRegistry, RegistryEvent, ResourceLedger};
use fleetgrid_scheduler::{
    CachedDistributor, Dispatcher, ExecutableDistributor, Scheduler, SchedulerConfig,
};
use fleetgrid_state::{ExecutableRef, StateStore};

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single-node, all subsystems in one process).
    Standalone {
        /// Data directory for persistent state and staged executables.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Seconds without a heartbeat before a device is marked offline.
        #[arg(long, default_value = "30")]
        heartbeat_timeout: u64,

        /// Registry offline sweep interval in seconds.
        #[arg(long, default_value = "10")]
        sweep_interval: u64,

        /// Scheduler tick interval in seconds.
        #[arg(long, default_value = "5")]
        schedule_interval: u64,

        /// Staging attempts before a workload is failed.
        #[arg(long, default_value = "3")]
        staging_retries: u32,
    },
}

/// Stages executables into the local filesystem. Standalone mode runs
/// everything in one process, so "transfer" is a copy out of the store.
struct LocalStager {
    state: StateStore,
    staging_dir: PathBuf,
}

impl LocalStager {
    fn new(state: StateStore, staging_dir: &Path) -> Self {
        Self {
            state,
            staging_dir: staging_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl ExecutableDistributor for LocalStager {
    async fn ensure_staged(&self, device_id: &str, executable: &ExecutableRef) -> anyhow::Result<()> {
        let record = self
            .state
            .get_executable(executable)?
            .ok_or_else(|| anyhow::anyhow!("executable {} missing from store", executable.table_key()))?;
        let dir = self.staging_dir.join(device_id);
        let path = dir.join(executable.table_key());
        if tokio::fs::try_exists(&path).await? {
            debug!(%device_id, executable = %executable.table_key(), "already staged");
            return Ok(());
        }
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&path, &record.payload).await?;
        info!(%device_id, executable = %executable.table_key(), bytes = record.payload.len(), "staged executable");
        Ok(())
    }
}

/// Dispatch endpoint for the standalone node. A real fleet talks to a
/// remote agent here; standalone just records the handoff.
struct LocalDispatcher;

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&self, device_id: &str, workload_id: &str) -> anyhow::Result<()> {
        info!(%device_id, %workload_id, "dispatched workload");
        Ok(())
    }

    async fn cancel(&self, device_id: &str, workload_id: &str) {
        info!(%device_id, %workload_id, "cancel signalled");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleetgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            heartbeat_timeout,
            sweep_interval,
            schedule_interval,
            staging_retries,
        } => {
            run_standalone(
                data_dir,
                heartbeat_timeout,
                sweep_interval,
                schedule_interval,
                staging_retries,
            )
            .await
        }
    }
}

async fn run_standalone(
    data_dir: PathBuf,
    heartbeat_timeout: u64,
    sweep_interval: u64,
    schedule_interval: u64,
    staging_retries: u32,
) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Resource ledger + device registry.
    let ledger = Arc::new(ResourceLedger::new());
    let registry = Arc::new(
        DeviceRegistry::new(state.clone(), ledger)
            .with_offline_timeout(Duration::from_secs(heartbeat_timeout)),
    );
    info!(timeout = heartbeat_timeout, "device registry initialized");

    // Capability hub. Devices publish their I/O capability lists here;
    // subscribers reconcile against the full replacement list.
    let capabilities = Arc::new(CapabilityHub::new());

    // Scheduler.
    let staging_dir = data_dir.join("staging");
    let scheduler = Arc::new(
        Scheduler::new(
            state.clone(),
            registry.clone(),
            Arc::new(CachedDistributor::new(LocalStager::new(
                state.clone(),
                &staging_dir,
            ))),
            Arc::new(LocalDispatcher),
        )
        .with_config(SchedulerConfig {
            staging_retry_limit: staging_retries,
            ..SchedulerConfig::default()
        }),
    );
    let requeued = scheduler.recover()?;
    info!(requeued, "scheduler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_shutdown = shutdown_rx.clone();
    let scheduler_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    // Registry offline sweep loop.
    let sweep_registry = registry.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut shutdown = sweep_shutdown;
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => match sweep_registry.sweep_offline() {
                    Ok(offline) if !offline.is_empty() => {
                        warn!(count = offline.len(), "devices went offline");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "offline sweep failed"),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Capability watcher: one observer per device, started the first
    // time the device comes online.
    let watch_hub = capabilities.clone();
    let mut watch_events = registry.subscribe();
    let watch_shutdown = shutdown_rx.clone();
    let capability_handle = tokio::spawn(async move {
        let mut shutdown = watch_shutdown;
        let mut watched = std::collections::HashSet::new();
        loop {
            tokio::select! {
                event = watch_events.recv() => match event {
                    Ok(RegistryEvent::DeviceOnline(device_id)) => {
                        if watched.insert(device_id.clone()) {
                            let mut rx = watch_hub.subscribe(&device_id);
                            tokio::spawn(async move {
                                while rx.changed().await.is_ok() {
                                    let count = rx.borrow().len();
                                    info!(%device_id, count, "capability list replaced");
                                }
                            });
                        }
                    }
                    Ok(RegistryEvent::DeviceOffline(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Scheduler loop.
    let run_scheduler = scheduler.clone();
    let scheduler_handle = tokio::spawn(async move {
        run_scheduler
            .run(Duration::from_secs(schedule_interval), scheduler_shutdown)
            .await;
    });

    // ── Wait for shutdown ──────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = sweep_handle.await;
    let _ = capability_handle.await;
    let _ = scheduler_handle.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}
