//! Revert engine - the state machine driving confirm-or-revert
//!
//! A single event loop consumes change events, confirmation requests and
//! deadline expiries from channels, so every transition for a given pending
//! change is serialized. Blocking work (snapshot capture, restore, service
//! hooks) runs on spawned tasks that report back through the same loop; a
//! per-resource in-flight guard keeps two operations for one resource from
//! overlapping while unrelated resources proceed concurrently.
//!
//! The engine holds a baseline of each watched file's last accepted content.
//! Auto snapshots capture that baseline, not the already-modified file on
//! disk, and a change event whose content matches the baseline is the echo
//! of our own restore (or a manual undo) and is dropped rather than
//! re-protected.

use crate::errors::{CaptureError, ConfirmError, NotPendingError, RestoreError, SchedulerPersistError};
use crate::fingerprint::{fingerprint, fingerprint_bytes};
use crate::notifier;
use crate::scheduler::{next_deadline, DeadlineScheduler};
use crate::state::PendingTable;
use crate::store::{file_mode, CaptureSource, FileBlob, SnapshotStore};
use chrono::{DateTime, Duration, Utc};
use revertit_common::config::{Config, PendingPolicy, RevertConfig, ServiceHook};
use revertit_common::events::{EngineEvent, EventKind, EventLog};
use revertit_common::{
    new_change_id, ChangeCategory, ChangeEvent, ChangeState, Fingerprint, PendingChange,
    SnapshotKind, SnapshotMeta,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Everything the engine coordinates, built once at startup and passed in
/// explicitly.
pub struct EngineContext {
    pub config: Config,
    pub store: Arc<SnapshotStore>,
    pub table: Arc<PendingTable>,
    pub scheduler: Arc<DeadlineScheduler>,
    pub events: EventLog,
    /// Run external alert commands (disabled in tests).
    pub alerts_enabled: bool,
}

/// Messages driving the engine loop. Confirmations and completions of
/// spawned work arrive here alongside nothing else touching engine state.
pub enum EngineTrigger {
    Confirm {
        id: String,
        reply: oneshot::Sender<Result<(), ConfirmError>>,
    },
    CaptureDone {
        event: ChangeEvent,
        result: Result<SnapshotMeta, CaptureError>,
    },
    RevertDone {
        id: String,
        result: Result<(), RestoreError>,
    },
}

/// Cheap handle for the confirmation gateway (RPC server).
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineTrigger>,
}

impl EngineHandle {
    /// Confirm a pending change. Idempotent for already-confirmed ids;
    /// anything else non-pending is rejected.
    pub async fn confirm(&self, id: &str) -> Result<(), ConfirmError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineTrigger::Confirm {
                id: id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ConfirmError::Persist {
                id: id.to_string(),
                detail: "engine stopped".to_string(),
            })?;

        reply_rx.await.map_err(|_| ConfirmError::Persist {
            id: id.to_string(),
            detail: "engine dropped request".to_string(),
        })?
    }
}

/// Last accepted content of a watched path. None blob means the path did
/// not exist in that state.
struct Baseline {
    blob: Option<FileBlob>,
    fingerprint: Fingerprint,
}

pub struct RevertEngine {
    ctx: EngineContext,
    baseline: HashMap<PathBuf, Baseline>,
    /// Paths with a capture or restore currently running.
    in_flight: HashSet<PathBuf>,
    tx: mpsc::Sender<EngineTrigger>,
    trigger_rx: mpsc::Receiver<EngineTrigger>,
    /// Initial watch set used to seed the baseline during recovery.
    watched: Vec<PathBuf>,
}

impl RevertEngine {
    pub fn new(ctx: EngineContext, watched: Vec<PathBuf>) -> (Self, EngineHandle) {
        let (tx, trigger_rx) = mpsc::channel(256);
        let handle = EngineHandle { tx: tx.clone() };
        (
            Self {
                ctx,
                baseline: HashMap::new(),
                in_flight: HashSet::new(),
                tx,
                trigger_rx,
                watched,
            },
            handle,
        )
    }

    /// Run the engine: recovery first, then the trigger loop. Recovery
    /// completes before the first change event is consumed, so a change that
    /// expired while the daemon was down is never mistaken for a fresh one.
    pub async fn run(
        mut self,
        mut change_rx: mpsc::Receiver<ChangeEvent>,
        mut expiry_rx: mpsc::Receiver<String>,
    ) {
        self.recover().await;
        info!("Revert engine ready");

        loop {
            tokio::select! {
                trigger = self.trigger_rx.recv() => {
                    match trigger {
                        Some(EngineTrigger::Confirm { id, reply }) => {
                            let result = self.handle_confirm(&id).await;
                            let _ = reply.send(result);
                        }
                        Some(EngineTrigger::CaptureDone { event, result }) => {
                            self.handle_capture_done(event, result).await;
                        }
                        Some(EngineTrigger::RevertDone { id, result }) => {
                            self.handle_revert_done(&id, result).await;
                        }
                        None => break,
                    }
                }
                expiry = expiry_rx.recv() => {
                    match expiry {
                        Some(id) => self.handle_expiry(&id).await,
                        None => break,
                    }
                }
                change = change_rx.recv() => {
                    match change {
                        Some(event) => self.handle_change(event).await,
                        None => break,
                    }
                }
            }
        }

        info!("Revert engine stopped");
    }

    /// Reload persisted state: re-arm future deadlines, fire past ones,
    /// resume reverts interrupted mid-flight, and rebuild the baseline.
    async fn recover(&mut self) {
        // Baseline: for a path under an unresolved change the accepted
        // content is what its snapshot holds, not the modified file on disk.
        for path in self.watched.clone() {
            let active = self
                .ctx
                .table
                .pending_for(&path)
                .await
                .or(self.unresolved_for(&path).await);

            let baseline = match &active {
                Some(change) => match self
                    .ctx
                    .store
                    .captured_source(&change.snapshot_id, &path)
                    .await
                {
                    Some(source) => baseline_from_source(source),
                    None => load_disk_baseline(&path),
                },
                None => load_disk_baseline(&path),
            };
            self.baseline.insert(path, baseline);
        }

        let now = Utc::now();
        let all = self.ctx.table.all().await;
        let mut rearmed = 0;
        let mut fired = 0;
        let mut resumed = 0;

        for change in all {
            match change.state {
                ChangeState::Pending => {
                    if change.is_expired(now) {
                        fired += 1;
                        self.handle_expiry(&change.id).await;
                    } else {
                        rearmed += 1;
                        self.ctx.scheduler.schedule(&change.id, change.deadline).await;
                    }
                }
                ChangeState::Expired => {
                    // Crashed after expiry but before the revert finished.
                    resumed += 1;
                    self.in_flight.insert(change.resource.clone());
                    self.spawn_revert(change);
                }
                _ => {}
            }
        }

        info!(
            "Recovery complete: {} deadlines re-armed, {} fired immediately, {} reverts resumed",
            rearmed, fired, resumed
        );
    }

    async fn unresolved_for(&self, path: &Path) -> Option<PendingChange> {
        self.ctx
            .table
            .all()
            .await
            .into_iter()
            .find(|c| c.resource == path && c.state == ChangeState::Expired)
    }

    /// A settled change event from the watcher.
    async fn handle_change(&mut self, event: ChangeEvent) {
        let path = event.path.clone();

        if self.in_flight.contains(&path) {
            debug!(
                "Operation in flight for {}, deferring change detection to next scan",
                path.display()
            );
            return;
        }

        // Content equal to the baseline is our own restore echoing back, or
        // the operator undoing by hand. Nothing to protect.
        if let Some(baseline) = self.baseline.get(&path) {
            if baseline.fingerprint == event.current {
                debug!("{} returned to baseline content, ignoring", path.display());
                return;
            }
        }

        if let Some(existing) = self.ctx.table.pending_for(&path).await {
            match self.ctx.config.timeouts.on_pending_change {
                PendingPolicy::Extend => {
                    let deadline = self.deadline_for(event.category);
                    match self.ctx.table.set_deadline(&existing.id, deadline).await {
                        Ok(_) => {
                            self.ctx.scheduler.schedule(&existing.id, deadline).await;
                            info!(
                                "Continued editing on {}, deadline for {} moved to {}",
                                path.display(),
                                existing.id,
                                deadline
                            );
                        }
                        Err(e) => {
                            error!(
                                "Could not extend deadline for {}: {:#}; keeping old deadline",
                                existing.id, e
                            );
                        }
                    }
                }
                PendingPolicy::Ignore => {
                    debug!(
                        "{} already pending as {}, ignoring new event",
                        path.display(),
                        existing.id
                    );
                }
            }
            return;
        }

        // New change: capture the baseline state before anything else.
        self.in_flight.insert(path.clone());

        let source = match self.baseline.get(&path) {
            Some(baseline) => CaptureSource {
                path: path.clone(),
                state: baseline.blob.clone(),
            },
            // Never seen before (e.g. appeared via glob): it did not exist
            // in the accepted state, so revert means deletion.
            None => CaptureSource {
                path: path.clone(),
                state: None,
            },
        };

        let store = Arc::clone(&self.ctx.store);
        let tx = self.tx.clone();
        let description = format!("pre-change snapshot for {}", path.display());

        tokio::spawn(async move {
            let result = store
                .capture(&[source], &description, SnapshotKind::Auto)
                .await;
            let _ = tx.send(EngineTrigger::CaptureDone { event, result }).await;
        });
    }

    /// Snapshot capture finished; create the pending change or let the
    /// change through unprotected.
    async fn handle_capture_done(
        &mut self,
        event: ChangeEvent,
        result: Result<SnapshotMeta, CaptureError>,
    ) {
        let path = event.path.clone();
        self.in_flight.remove(&path);

        let meta = match result {
            Ok(meta) => meta,
            Err(e) => {
                // Protecting nothing is worse than blocking all changes:
                // the change stands, loudly unprotected.
                error!("Snapshot capture failed for {}: {}", path.display(), e);
                self.emit(
                    EngineEvent::new(EventKind::Unprotected, &path, None)
                        .with_detail(e.to_string()),
                );
                self.refresh_baseline_from_disk(&path);
                return;
            }
        };

        let deadline = self.deadline_for(event.category);
        let change = PendingChange {
            id: new_change_id(event.category),
            resource: path.clone(),
            category: event.category,
            kind: event.kind,
            snapshot_id: meta.id.clone(),
            created_at: Utc::now(),
            deadline,
            state: ChangeState::Pending,
        };
        let change_id = change.id.clone();

        // The deadline must be durable before the timer exists; an
        // unpersisted deadline would vanish on restart.
        if let Err(e) = self.ctx.table.insert(change).await {
            let persist_err = SchedulerPersistError {
                id: change_id.clone(),
                source: e,
            };
            error!("{}; change on {} proceeds unprotected", persist_err, path.display());
            if let Err(del) = self.ctx.store.delete(&meta.id).await {
                warn!("Could not discard orphaned snapshot {}: {:#}", meta.id, del);
            }
            self.emit(
                EngineEvent::new(EventKind::Unprotected, &path, None)
                    .with_detail(persist_err.to_string()),
            );
            self.refresh_baseline_from_disk(&path);
            return;
        }

        self.ctx.scheduler.schedule(&change_id, deadline).await;

        info!(
            "Change on {} pending as {} (snapshot {}, confirm before {})",
            path.display(),
            change_id,
            meta.id,
            deadline
        );
        self.emit(
            EngineEvent::new(EventKind::ChangeDetected, &path, Some(&change_id))
                .with_detail(format!("confirm before {}", deadline)),
        );

        // Opportunistic retention pass after each successful capture.
        let referenced = self.ctx.table.referenced_snapshots().await;
        self.ctx.store.cleanup(&referenced).await;
    }

    /// Confirmation request from the gateway.
    async fn handle_confirm(&mut self, id: &str) -> Result<(), ConfirmError> {
        let change = match self.ctx.table.get(id).await {
            Some(change) => change,
            None => {
                return Err(NotPendingError::Unknown(id.to_string()).into());
            }
        };

        match change.state {
            ChangeState::Pending => {}
            // Confirming twice is a no-op success.
            ChangeState::Confirmed => return Ok(()),
            state => {
                return Err(NotPendingError::AlreadyResolved {
                    id: id.to_string(),
                    state: state.to_string(),
                }
                .into());
            }
        }

        // Persist the transition first; only then disarm the timer. If the
        // write fails the record is still pending and the timer still runs.
        self.ctx
            .table
            .set_state(id, ChangeState::Confirmed)
            .await
            .map_err(|e| ConfirmError::Persist {
                id: id.to_string(),
                detail: format!("{:#}", e),
            })?;
        self.ctx.scheduler.cancel(id).await;

        info!("Change {} on {} confirmed", id, change.resource.display());
        self.emit(EngineEvent::new(
            EventKind::Confirmed,
            &change.resource,
            Some(id),
        ));

        // The confirmed content becomes the new accepted state. The
        // snapshot is left for the retention policy to collect.
        self.refresh_baseline_from_disk(&change.resource);
        Ok(())
    }

    /// Deadline fired without confirmation.
    async fn handle_expiry(&mut self, id: &str) {
        let change = match self.ctx.table.get(id).await {
            Some(change) => change,
            None => {
                debug!("Expiry for unknown change {}, ignoring", id);
                return;
            }
        };

        if change.state != ChangeState::Pending {
            // Late or duplicate expiry after the change resolved.
            debug!("Expiry for {} in state {}, no-op", id, change.state);
            return;
        }

        // A stale expiry from before a deadline extension: the re-armed
        // timer owns the new deadline. The 1s tolerance absorbs timer
        // rounding without ever dropping a real wakeup.
        if (change.deadline - Utc::now()) > Duration::seconds(1) {
            debug!(
                "Expiry for {} arrived before its extended deadline, ignoring",
                id
            );
            return;
        }

        match self.ctx.table.set_state(id, ChangeState::Expired).await {
            Ok(_) => {}
            Err(e) => {
                // Keep the expiry alive rather than losing it: retry soon.
                error!("Could not persist expiry of {}: {:#}; retrying in 60s", id, e);
                self.ctx
                    .scheduler
                    .schedule(id, Utc::now() + Duration::seconds(60))
                    .await;
                return;
            }
        }

        warn!(
            "Change {} on {} was not confirmed in time, reverting",
            id,
            change.resource.display()
        );
        self.emit(EngineEvent::new(
            EventKind::Expired,
            &change.resource,
            Some(id),
        ));

        self.in_flight.insert(change.resource.clone());
        self.spawn_revert(change);
    }

    /// Run the restore (with bounded retries), connectivity diagnostic and
    /// service hooks off the engine loop.
    fn spawn_revert(&self, change: PendingChange) {
        let store = Arc::clone(&self.ctx.store);
        let revert = self.ctx.config.revert.clone();
        let tx = self.tx.clone();
        let id = change.id.clone();

        tokio::spawn(async move {
            if revert.connectivity_check {
                check_connectivity(&revert).await;
            }

            let result = restore_with_retries(&store, &change, &revert).await;

            if result.is_ok() {
                if let Some(hook) = revert.hook_for(change.category) {
                    run_service_hook(change.category, hook).await;
                }
            }

            let _ = tx.send(EngineTrigger::RevertDone { id, result }).await;
        });
    }

    /// Revert finished (or gave up); settle the terminal state.
    async fn handle_revert_done(&mut self, id: &str, result: Result<(), RestoreError>) {
        let Some(change) = self.ctx.table.get(id).await else {
            warn!("Revert completion for unknown change {}", id);
            return;
        };
        self.in_flight.remove(&change.resource);

        match result {
            Ok(()) => {
                if let Err(e) = self.ctx.table.set_state(id, ChangeState::Reverted).await {
                    error!("Reverted {} but could not persist state: {:#}", id, e);
                }
                warn!(
                    "Change on {} was not confirmed and has been reverted",
                    change.resource.display()
                );
                self.emit(EngineEvent::new(
                    EventKind::Reverted,
                    &change.resource,
                    Some(id),
                ));
            }
            Err(e) => {
                if let Err(pe) = self.ctx.table.set_state(id, ChangeState::RevertFailed).await {
                    error!("Could not persist revert failure of {}: {:#}", id, pe);
                }
                error!(
                    "REVERT FAILED for {} on {}: {}; manual intervention required",
                    id,
                    change.resource.display(),
                    e
                );
                self.emit(
                    EngineEvent::new(EventKind::RevertFailed, &change.resource, Some(id))
                        .with_detail(e.to_string()),
                );
            }
        }

        // Whatever is on disk now is the accepted state going forward.
        self.refresh_baseline_from_disk(&change.resource);
    }

    fn deadline_for(&self, category: ChangeCategory) -> DateTime<Utc> {
        let policy = self.ctx.config.timeouts.policy_for(category);
        match next_deadline(&policy, Utc::now()) {
            Ok(deadline) => deadline,
            Err(e) => {
                warn!(
                    "Bad timeout policy for {} ({:#}), falling back to 300s",
                    category, e
                );
                Utc::now() + Duration::seconds(300)
            }
        }
    }

    fn refresh_baseline_from_disk(&mut self, path: &Path) {
        self.baseline
            .insert(path.to_path_buf(), load_disk_baseline(path));
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.ctx.events.append(&event) {
            warn!("Could not append audit event: {}", e);
        }
        if self.ctx.alerts_enabled {
            tokio::spawn(notifier::send_alert(event));
        }
    }
}

fn baseline_from_source(source: CaptureSource) -> Baseline {
    match source.state {
        Some(blob) => Baseline {
            fingerprint: fingerprint_bytes(&blob.content),
            blob: Some(blob),
        },
        None => Baseline {
            blob: None,
            fingerprint: Fingerprint::Missing,
        },
    }
}

fn load_disk_baseline(path: &Path) -> Baseline {
    match std::fs::read(path) {
        Ok(content) => Baseline {
            fingerprint: fingerprint_bytes(&content),
            blob: Some(FileBlob {
                mode: file_mode(path).unwrap_or(0o644),
                content,
            }),
        },
        Err(_) => Baseline {
            blob: None,
            fingerprint: fingerprint(path),
        },
    }
}

/// Bounded restore retries with linear backoff. A missing snapshot is
/// unrecoverable and fails immediately.
async fn restore_with_retries(
    store: &SnapshotStore,
    change: &PendingChange,
    revert: &RevertConfig,
) -> Result<(), RestoreError> {
    let attempts = revert.restore_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match store.restore(&change.snapshot_id).await {
            Ok(()) => return Ok(()),
            Err(e @ RestoreError::NotFound(_)) => return Err(e),
            Err(e) => {
                warn!(
                    "Restore attempt {}/{} for {} failed: {}",
                    attempt, attempts, change.id, e
                );
                last_err = Some(e);
                if attempt < attempts {
                    let backoff = revert.retry_backoff_secs * attempt as u64;
                    tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or(RestoreError::NotFound(change.snapshot_id.clone())))
}

/// Ping the configured endpoints and log whether the expired change appears
/// to have broken connectivity. Diagnostic only, never blocks the revert.
async fn check_connectivity(revert: &RevertConfig) {
    for endpoint in &revert.connectivity_endpoints {
        let output = tokio::process::Command::new("ping")
            .args([
                "-c",
                "1",
                "-W",
                &revert.connectivity_timeout_secs.to_string(),
                endpoint,
            ])
            .output()
            .await;

        if matches!(output, Ok(o) if o.status.success()) {
            debug!("Connectivity check passed via {}", endpoint);
            return;
        }
    }

    warn!("All connectivity checks failed; the expired change may have broken connectivity");
}

/// Restart the category's services after a restore, then verify. Failures
/// are logged, not escalated: the files themselves are already back.
async fn run_service_hook(category: ChangeCategory, hook: &ServiceHook) {
    match run_command(&hook.restart).await {
        Ok(true) => info!("Restarted services for {}", category),
        Ok(false) => warn!("Service restart for {} reported failure", category),
        Err(e) => warn!("Could not run service restart for {}: {}", category, e),
    }

    if let Some(verify) = &hook.verify {
        match run_command(verify).await {
            Ok(true) => debug!("Post-revert verification passed for {}", category),
            Ok(false) => warn!("Post-revert verification failed for {}", category),
            Err(e) => warn!("Could not run verification for {}: {}", category, e),
        }
    }
}

async fn run_command(command: &str) -> std::io::Result<bool> {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Ok(true);
    };

    let output = tokio::process::Command::new(program)
        .args(parts)
        .output()
        .await?;
    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use revertit_common::ChangeKind;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    struct Harness {
        config: Config,
        change_tx: mpsc::Sender<ChangeEvent>,
        handle: EngineHandle,
        table: Arc<PendingTable>,
        store: Arc<SnapshotStore>,
    }

    fn test_config(root: &Path, timeout_secs: u64) -> Config {
        let mut config = Config::default();
        config.state_dir = root.join("state");
        config.snapshots.location = root.join("snapshots");
        config.snapshots.max_snapshots = 50;
        config.timeouts.min_secs = 0;
        config.timeouts.system = revertit_common::config::TimeoutPolicy::Secs(timeout_secs);
        config.revert.connectivity_check = false;
        config.revert.service_hooks.clear();
        config.revert.restore_attempts = 1;
        config.revert.retry_backoff_secs = 0;
        config
    }

    async fn start_engine(config: Config, watched: Vec<PathBuf>) -> Harness {
        let store = Arc::new(SnapshotStore::new(
            config.snapshots.location.clone(),
            config.snapshots.max_snapshots,
            Vec::new(),
        ));
        let table = Arc::new(PendingTable::open(config.pending_dir()).unwrap());
        let (scheduler, expiry_rx) = DeadlineScheduler::new(64);
        let events = EventLog::new(config.events_log());

        let ctx = EngineContext {
            config: config.clone(),
            store: Arc::clone(&store),
            table: Arc::clone(&table),
            scheduler: Arc::new(scheduler),
            events,
            alerts_enabled: false,
        };

        let (engine, handle) = RevertEngine::new(ctx, watched);
        let (change_tx, change_rx) = mpsc::channel(64);
        tokio::spawn(engine.run(change_rx, expiry_rx));
        // Let recovery finish before tests start feeding events.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        Harness {
            config,
            change_tx,
            handle,
            table,
            store,
        }
    }

    fn change_event(path: &Path) -> ChangeEvent {
        ChangeEvent {
            path: path.to_path_buf(),
            category: ChangeCategory::System,
            kind: ChangeKind::Modified,
            detected_at: Utc::now(),
            previous: Fingerprint::Missing,
            current: fingerprint(path),
        }
    }

    async fn wait_for_state(
        table: &PendingTable,
        id: &str,
        state: ChangeState,
        timeout: StdDuration,
    ) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if let Some(change) = table.get(id).await {
                if change.state == state {
                    return true;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        false
    }

    async fn wait_for_pending(table: &PendingTable, timeout: StdDuration) -> Option<PendingChange> {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if let Some(change) = table.pending().await.into_iter().next() {
                return Some(change);
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        None
    }

    /// First record in any state; for tests whose deadline is so short the
    /// record may resolve before we can observe it pending.
    async fn wait_for_any(table: &PendingTable, timeout: StdDuration) -> Option<PendingChange> {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if let Some(change) = table.all().await.into_iter().next() {
                return Some(change);
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_change_creates_single_pending_with_snapshot() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("etc").join("app.conf");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 600);
        let h = start_engine(config, vec![file.clone()]).await;

        std::fs::write(&file, "modified").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();

        let pending = wait_for_pending(&h.table, StdDuration::from_secs(3))
            .await
            .expect("pending change created");
        assert_eq!(pending.resource, file);
        assert_eq!(pending.state, ChangeState::Pending);

        // The snapshot holds the pre-change content, not what is on disk.
        let source = h
            .store
            .captured_source(&pending.snapshot_id, &file)
            .await
            .unwrap();
        assert_eq!(source.state.unwrap().content, b"original");
    }

    #[tokio::test]
    async fn test_uniqueness_one_pending_per_resource() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 600);
        let h = start_engine(config, vec![file.clone()]).await;

        // A burst of events for the same resource.
        for content in ["v1", "v2", "v3"] {
            std::fs::write(&file, content).unwrap();
            h.change_tx.send(change_event(&file)).await.unwrap();
        }

        wait_for_pending(&h.table, StdDuration::from_secs(3))
            .await
            .expect("pending change created");
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        let pending = h.table.pending().await;
        assert_eq!(pending.len(), 1, "exactly one pending change per resource");
    }

    #[tokio::test]
    async fn test_confirm_keeps_new_content() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 600);
        let h = start_engine(config, vec![file.clone()]).await;

        std::fs::write(&file, "modified").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();

        let pending = wait_for_pending(&h.table, StdDuration::from_secs(3))
            .await
            .unwrap();

        h.handle.confirm(&pending.id).await.unwrap();
        assert_eq!(
            h.table.get(&pending.id).await.unwrap().state,
            ChangeState::Confirmed
        );
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "modified");

        // Idempotent on repeat.
        h.handle.confirm(&pending.id).await.unwrap();

        // Unknown ids are rejected.
        let err = h.handle.confirm("system-ffffffff").await.unwrap_err();
        assert!(matches!(
            err,
            ConfirmError::NotPending(NotPendingError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_expiry_reverts_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 0);
        let h = start_engine(config, vec![file.clone()]).await;

        std::fs::write(&file, "bad change").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();

        let pending = wait_for_any(&h.table, StdDuration::from_secs(3))
            .await
            .unwrap();
        assert!(
            wait_for_state(
                &h.table,
                &pending.id,
                ChangeState::Reverted,
                StdDuration::from_secs(5)
            )
            .await
        );
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original");

        // Confirming after the revert is rejected, not applied.
        let err = h.handle.confirm(&pending.id).await.unwrap_err();
        assert!(matches!(
            err,
            ConfirmError::NotPending(NotPendingError::AlreadyResolved { .. })
        ));
    }

    #[tokio::test]
    async fn test_confirm_expire_race_yields_one_terminal_state() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 0);
        let h = start_engine(config, vec![file.clone()]).await;

        std::fs::write(&file, "racy change").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();

        let pending = wait_for_any(&h.table, StdDuration::from_secs(3))
            .await
            .unwrap();

        // Expiry is already in flight (timeout 0); race a confirm against it.
        let _ = h.handle.confirm(&pending.id).await;

        // Wait until the dust settles in a terminal state.
        let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
        let final_state = loop {
            let state = h.table.get(&pending.id).await.unwrap().state;
            if state.is_terminal() {
                break state;
            }
            assert!(std::time::Instant::now() < deadline, "never reached terminal state");
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        };

        let content = std::fs::read_to_string(&file).unwrap();
        match final_state {
            ChangeState::Confirmed => assert_eq!(content, "racy change"),
            ChangeState::Reverted => assert_eq!(content, "original"),
            other => panic!("unexpected terminal state {}", other),
        }
    }

    #[tokio::test]
    async fn test_restart_rearms_future_deadline() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 600);
        let pending_id;
        {
            let h = start_engine(config.clone(), vec![file.clone()]).await;
            std::fs::write(&file, "modified").unwrap();
            h.change_tx.send(change_event(&file)).await.unwrap();
            let pending = wait_for_pending(&h.table, StdDuration::from_secs(3))
                .await
                .unwrap();
            pending_id = pending.id;
            // Engine task dies with the harness channels going out of scope.
        }

        // Second life: the record must still be pending with its deadline.
        let h = start_engine(config, vec![file.clone()]).await;
        let change = h.table.get(&pending_id).await.unwrap();
        assert_eq!(change.state, ChangeState::Pending);
        assert!(change.remaining_secs(Utc::now()) > 500);

        // And confirmable as usual.
        h.handle.confirm(&pending_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_fires_past_deadline_immediately() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 600);
        let pending_id;
        {
            let h = start_engine(config.clone(), vec![file.clone()]).await;
            std::fs::write(&file, "modified").unwrap();
            h.change_tx.send(change_event(&file)).await.unwrap();
            let pending = wait_for_pending(&h.table, StdDuration::from_secs(3))
                .await
                .unwrap();
            pending_id = pending.id.clone();

            // Simulate the deadline passing while the daemon was down.
            h.table
                .set_deadline(&pending.id, Utc::now() - Duration::seconds(30))
                .await
                .unwrap();
        }

        let h = start_engine(config, vec![file.clone()]).await;
        assert!(
            wait_for_state(
                &h.table,
                &pending_id,
                ChangeState::Reverted,
                StdDuration::from_secs(5)
            )
            .await
        );
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_revert_echo_does_not_reprotect() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 0);
        let h = start_engine(config, vec![file.clone()]).await;

        std::fs::write(&file, "bad change").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();

        let pending = wait_for_any(&h.table, StdDuration::from_secs(3))
            .await
            .unwrap();
        assert!(
            wait_for_state(
                &h.table,
                &pending.id,
                ChangeState::Reverted,
                StdDuration::from_secs(5)
            )
            .await
        );

        // The watcher notices the restore write and reports it; content now
        // matches the baseline, so no new pending change appears.
        h.change_tx.send(change_event(&file)).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        assert!(h.table.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_snapshot_escalates_to_revert_failed() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "original").unwrap();

        let config = test_config(dir.path(), 600);
        let h = start_engine(config, vec![file.clone()]).await;

        std::fs::write(&file, "doomed change").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();

        let pending = wait_for_pending(&h.table, StdDuration::from_secs(3))
            .await
            .unwrap();

        // Sabotage: remove the snapshot out from under the engine, then let
        // the deadline fire.
        std::fs::remove_dir_all(
            h.config
                .snapshots
                .location
                .join(&pending.snapshot_id),
        )
        .unwrap();
        h.table
            .set_deadline(&pending.id, Utc::now())
            .await
            .unwrap();
        // Stop the first engine and let a restarted one find the
        // past-deadline record during recovery.
        drop(h.change_tx);

        let h2 = start_engine(test_config(dir.path(), 600), vec![file.clone()]).await;
        assert!(
            wait_for_state(
                &h2.table,
                &pending.id,
                ChangeState::RevertFailed,
                StdDuration::from_secs(5)
            )
            .await
        );
        // The broken content is left in place for the operator.
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "doomed change");
    }

    #[tokio::test]
    async fn test_scenario_confirm_then_expire() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("firewall.conf");
        std::fs::write(&file, "A").unwrap();

        // Generous timeout for the confirmed leg; the expiring leg gets its
        // deadline moved below.
        let config = test_config(dir.path(), 600);
        let h = start_engine(config, vec![file.clone()]).await;

        // t=0: A -> B, confirmed in time. File keeps B.
        std::fs::write(&file, "B").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();
        let p0 = wait_for_pending(&h.table, StdDuration::from_secs(3))
            .await
            .unwrap();
        h.handle.confirm(&p0.id).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "B");

        // Later: B -> C with no confirmation. Revert rewrites B.
        std::fs::write(&file, "C").unwrap();
        h.change_tx.send(change_event(&file)).await.unwrap();
        let p1 = wait_for_pending(&h.table, StdDuration::from_secs(3))
            .await
            .unwrap();
        assert_ne!(p0.id, p1.id);

        // Snapshot for the second change holds B, the confirmed content.
        let source = h.store.captured_source(&p1.snapshot_id, &file).await.unwrap();
        assert_eq!(source.state.unwrap().content, b"B");
    }
}
