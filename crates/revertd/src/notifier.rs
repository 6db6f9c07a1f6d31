//! Notification system - Sends alerts to operators via appropriate channel
//!
//! Supports:
//! - GUI notifications (notify-send for desktop environments)
//! - Terminal broadcasts (wall for TTY/SSH users)
//!
//! Severity decides the channel: info and warning go to the desktop only,
//! critical alerts also reach every terminal, since a revert failure may
//! mean the desktop session is unreachable.

use revertit_common::events::{EngineEvent, Severity};
use std::process::Command;
use tracing::{info, warn};

/// Send an engine event to all appropriate channels.
pub async fn send_alert(event: EngineEvent) {
    let severity = event.kind.severity();
    let message = event.summary();

    send_gui_notification(&message, severity);

    if severity == Severity::Critical {
        send_terminal_broadcast(&message);
    }
}

/// Send GUI notification using notify-send
fn send_gui_notification(message: &str, severity: Severity) {
    let has_notify_send = Command::new("which")
        .arg("notify-send")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);

    if !has_notify_send {
        return;
    }

    let urgency = match severity {
        Severity::Info => "normal",
        Severity::Warning => "normal",
        Severity::Critical => "critical",
    };

    let result = Command::new("notify-send")
        .args([
            "--urgency",
            urgency,
            "--app-name",
            "RevertIT",
            "Configuration change",
            message,
        ])
        .output();

    match result {
        Ok(output) if output.status.success() => {
            info!("GUI notification sent");
        }
        Ok(_) => warn!("Failed to send GUI notification"),
        Err(e) => warn!("Error sending GUI notification: {}", e),
    }
}

/// Send terminal broadcast using wall
fn send_terminal_broadcast(message: &str) {
    let formatted = format!(
        "\nRevertIT alert\n\n{}\n\nRun 'revertctl pending' for details.\n",
        message
    );

    let result = Command::new("wall").arg(&formatted).output();

    match result {
        Ok(output) if output.status.success() => {
            info!("Terminal broadcast sent");
        }
        Ok(_) => warn!("Failed to send terminal broadcast"),
        Err(e) => warn!("Error sending terminal broadcast: {}", e),
    }
}
