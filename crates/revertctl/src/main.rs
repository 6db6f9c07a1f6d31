//! revertctl - operator CLI for the RevertIT daemon
//!
//! Confirm pending configuration changes, inspect deadlines, and manage
//! snapshots over the daemon's Unix socket.

mod output;
mod rpc_client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use revertit_common::ipc::{Method, ResponseData};
use rpc_client::RpcClient;

#[derive(Parser)]
#[command(
    name = "revertctl",
    version,
    about = "Timed confirmation for system configuration changes"
)]
struct Cli {
    /// Daemon socket path (overrides $REVERTD_SOCKET)
    #[arg(long, global = true)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show daemon status
    Status,

    /// List changes awaiting confirmation
    Pending,

    /// Confirm a pending change, cancelling its revert deadline
    Confirm {
        /// Pending change id (see `revertctl pending`)
        change_id: String,
    },

    /// Manage snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Show recent engine events
    Events {
        /// Number of events to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List snapshots, newest first
    List,

    /// Take a manual snapshot of all monitored paths
    Create {
        /// Description stored with the snapshot
        #[arg(long, default_value = "manual snapshot")]
        description: String,
    },

    /// Delete a snapshot
    Delete { snapshot_id: String },

    /// Restore a snapshot immediately
    Restore { snapshot_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = RpcClient::connect(cli.socket.as_deref()).await?;

    match cli.command {
        Command::Status => {
            if let ResponseData::Status(status) = client.call(Method::Status).await? {
                output::print_status(&status);
            }
        }

        Command::Pending => {
            if let ResponseData::Pending(pending) = client.call(Method::ListPending).await? {
                output::print_pending(&pending);
            }
        }

        Command::Confirm { change_id } => {
            match client.call(Method::Confirm { change_id }).await? {
                ResponseData::Confirmed { change_id } => {
                    println!("{} change {} confirmed", "ok:".green().bold(), change_id);
                }
                _ => println!("Unexpected response from daemon"),
            }
        }

        Command::Snapshot { action } => match action {
            SnapshotAction::List => {
                if let ResponseData::Snapshots(snapshots) =
                    client.call(Method::ListSnapshots).await?
                {
                    output::print_snapshots(&snapshots);
                }
            }
            SnapshotAction::Create { description } => {
                if let ResponseData::SnapshotCreated { snapshot_id } =
                    client.call(Method::CreateSnapshot { description }).await?
                {
                    println!("{} snapshot {} created", "ok:".green().bold(), snapshot_id);
                }
            }
            SnapshotAction::Delete { snapshot_id } => {
                client.call(Method::DeleteSnapshot { snapshot_id }).await?;
                println!("{} snapshot deleted", "ok:".green().bold());
            }
            SnapshotAction::Restore { snapshot_id } => {
                if let ResponseData::Restored { snapshot_id } =
                    client.call(Method::RestoreSnapshot { snapshot_id }).await?
                {
                    println!("{} snapshot {} restored", "ok:".green().bold(), snapshot_id);
                }
            }
        },

        Command::Events { limit } => {
            if let ResponseData::Events(events) = client.call(Method::RecentEvents { limit }).await?
            {
                output::print_events(&events);
            }
        }
    }

    Ok(())
}
