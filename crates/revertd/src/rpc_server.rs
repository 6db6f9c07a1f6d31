//! RPC Server - Unix socket server for daemon-client communication

use crate::engine::EngineHandle;
use crate::state::PendingTable;
use crate::store::{CaptureSource, SnapshotStore};
use crate::watcher;
use anyhow::{Context, Result};
use revertit_common::config::Config;
use revertit_common::events::EventLog;
use revertit_common::ipc::{Method, Request, Response, ResponseData, StatusData};
use revertit_common::{ChangeState, SnapshotKind};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

/// Daemon state shared across connections
pub struct DaemonState {
    pub version: String,
    pub start_time: std::time::Instant,
    pub config: Config,
    pub engine: EngineHandle,
    pub table: Arc<PendingTable>,
    pub store: Arc<SnapshotStore>,
    pub events: EventLog,
}

/// Start the RPC server on the given socket path.
pub async fn start_server(socket_path: PathBuf, state: Arc<DaemonState>) -> Result<()> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create socket directory")?;
    }

    // Remove stale socket from a previous run.
    let _ = tokio::fs::remove_file(&socket_path).await;

    let listener = UnixListener::bind(&socket_path).context("Failed to bind Unix socket")?;
    info!("RPC server listening on {}", socket_path.display());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o660))?;
    }

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read from socket")?;

        if bytes_read == 0 {
            break;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("Invalid request JSON: {}", e);
                continue;
            }
        };

        let response = handle_request(request.id, request.method, &state).await;

        let response_json = serde_json::to_string(&response)? + "\n";
        writer
            .write_all(response_json.as_bytes())
            .await
            .context("Failed to write response")?;
    }

    Ok(())
}

/// Handle a single request
async fn handle_request(id: u64, method: Method, state: &DaemonState) -> Response {
    let result = match method {
        Method::Ping => Ok(ResponseData::Ok),

        Method::Status => {
            let monitored = watcher::expand_patterns(&state.config.monitoring.patterns()).len();
            let status = StatusData {
                version: state.version.clone(),
                uptime_seconds: state.start_time.elapsed().as_secs(),
                monitored_paths: monitored,
                pending_changes: state.table.count_in_state(ChangeState::Pending).await,
                snapshot_count: state.store.list().await.len(),
                failed_reverts: state.table.count_in_state(ChangeState::RevertFailed).await,
            };
            Ok(ResponseData::Status(status))
        }

        Method::ListPending => {
            let pending = state.table.pending().await;
            Ok(ResponseData::Pending(pending))
        }

        Method::Confirm { change_id } => match state.engine.confirm(&change_id).await {
            Ok(()) => Ok(ResponseData::Confirmed { change_id }),
            Err(e) => Err(e.to_string()),
        },

        Method::ListSnapshots => {
            let snapshots = state.store.list().await;
            Ok(ResponseData::Snapshots(snapshots))
        }

        Method::CreateSnapshot { description } => {
            let expanded = watcher::expand_patterns(&state.config.monitoring.patterns());
            let mut sources = Vec::new();
            let mut failed = None;
            for (path, _) in expanded {
                match CaptureSource::live(&path) {
                    Ok(source) => sources.push(source),
                    Err(e) => {
                        failed = Some(e.to_string());
                        break;
                    }
                }
            }

            match failed {
                Some(e) => Err(e),
                None => match state
                    .store
                    .capture(&sources, &description, SnapshotKind::Manual)
                    .await
                {
                    Ok(meta) => Ok(ResponseData::SnapshotCreated {
                        snapshot_id: meta.id,
                    }),
                    Err(e) => Err(e.to_string()),
                },
            }
        }

        Method::DeleteSnapshot { snapshot_id } => {
            let referenced = state.table.referenced_snapshots().await;
            if referenced.contains(&snapshot_id) {
                Err(format!(
                    "snapshot {} is referenced by an unresolved change",
                    snapshot_id
                ))
            } else {
                match state.store.delete(&snapshot_id).await {
                    Ok(()) => Ok(ResponseData::Ok),
                    Err(e) => Err(format!("{:#}", e)),
                }
            }
        }

        Method::RestoreSnapshot { snapshot_id } => {
            match state.store.restore(&snapshot_id).await {
                Ok(()) => Ok(ResponseData::Restored { snapshot_id }),
                Err(e) => Err(e.to_string()),
            }
        }

        Method::RecentEvents { limit } => match state.events.recent(limit) {
            Ok(events) => Ok(ResponseData::Events(events)),
            Err(e) => Err(e.to_string()),
        },
    };

    Response { id, result }
}
