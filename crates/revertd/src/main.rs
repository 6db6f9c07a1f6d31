//! RevertIT Daemon - timed confirmation for system configuration changes
//!
//! Watches critical configuration paths, snapshots them before a detected
//! change takes effect, and automatically reverts any change the operator
//! does not confirm before its deadline.

use anyhow::{Context, Result};
use revertd::engine::{EngineContext, RevertEngine};
use revertd::payload;
use revertd::rpc_server::{self, DaemonState};
use revertd::scheduler::DeadlineScheduler;
use revertd::state::PendingTable;
use revertd::store::SnapshotStore;
use revertd::watcher::PathWatcher;
use revertit_common::events::EventLog;
use revertit_common::{paths, Config};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("RevertIT daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Cannot create state dir {}", config.state_dir.display()))?;
    std::fs::create_dir_all(&config.snapshots.location).with_context(|| {
        format!(
            "Cannot create snapshot dir {}",
            config.snapshots.location.display()
        )
    })?;

    // All shared state is built here once and handed to the components
    // explicitly; nothing global.
    let producers = payload::producers_from_config(&config.docker);
    let store = Arc::new(SnapshotStore::new(
        config.snapshots.location.clone(),
        config.snapshots.max_snapshots,
        producers,
    ));
    let table = Arc::new(PendingTable::open(config.pending_dir())?);
    let (scheduler, expiry_rx) = DeadlineScheduler::new(256);
    let scheduler = Arc::new(scheduler);
    let events = EventLog::new(config.events_log());

    let watcher = PathWatcher::from_config(&config.monitoring);
    let watched = watcher.expand().into_iter().map(|(p, _)| p).collect();

    let ctx = EngineContext {
        config: config.clone(),
        store: Arc::clone(&store),
        table: Arc::clone(&table),
        scheduler: Arc::clone(&scheduler),
        events: events.clone(),
        alerts_enabled: true,
    };
    let (engine, engine_handle) = RevertEngine::new(ctx, watched);

    // Engine first: its startup recovery completes before the first change
    // event is pulled off this channel.
    let (change_tx, change_rx) = mpsc::channel(256);
    let engine_task = tokio::spawn(engine.run(change_rx, expiry_rx));

    let _watch_task = watcher.spawn(change_tx);

    let daemon_state = Arc::new(DaemonState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        start_time: std::time::Instant::now(),
        config,
        engine: engine_handle,
        table,
        store,
        events,
    });
    let _rpc_task = tokio::spawn(rpc_server::start_server(paths::socket_path(), daemon_state));

    info!("RevertIT daemon ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = engine_task => {
            info!("Engine stopped, shutting down");
        }
    }

    info!("RevertIT daemon stopped");
    Ok(())
}
