//! Human-readable rendering of daemon responses.

use chrono::Utc;
use owo_colors::OwoColorize;
use revertit_common::events::{EngineEvent, Severity};
use revertit_common::ipc::StatusData;
use revertit_common::{PendingChange, SnapshotMeta};

pub fn print_status(status: &StatusData) {
    println!("{}", "RevertIT daemon".bold());
    println!("  version:          {}", status.version);
    println!("  uptime:           {}", format_duration(status.uptime_seconds));
    println!("  monitored paths:  {}", status.monitored_paths);
    println!("  pending changes:  {}", status.pending_changes);
    println!("  snapshots:        {}", status.snapshot_count);

    if status.failed_reverts > 0 {
        println!(
            "  {}  {}",
            "failed reverts:".red().bold(),
            status.failed_reverts.red().bold()
        );
    }
}

pub fn print_pending(pending: &[PendingChange]) {
    if pending.is_empty() {
        println!("No changes awaiting confirmation.");
        return;
    }

    let now = Utc::now();
    println!("{}", "Changes awaiting confirmation".bold());
    for change in pending {
        let remaining = change.remaining_secs(now);
        let remaining_str = if remaining > 0 {
            format_duration(remaining as u64)
        } else {
            "expiring".to_string()
        };

        println!(
            "  {}  {}  [{}]  reverts in {}",
            change.id.cyan(),
            change.resource.display(),
            change.category,
            remaining_str.yellow()
        );
    }
    println!();
    println!("Confirm with: revertctl confirm <id>");
}

pub fn print_snapshots(snapshots: &[SnapshotMeta]) {
    if snapshots.is_empty() {
        println!("No snapshots.");
        return;
    }

    println!("{}", "Snapshots (newest first)".bold());
    for meta in snapshots {
        let failed_payloads = meta.payloads.iter().filter(|p| !p.ok).count();
        let payload_note = if failed_payloads > 0 {
            format!(", {} payload errors", failed_payloads)
        } else if !meta.payloads.is_empty() {
            format!(", {} payloads", meta.payloads.len())
        } else {
            String::new()
        };

        println!(
            "  {}  {}  {}  ({} files, {}{})",
            meta.id.cyan(),
            meta.created_at.format("%Y-%m-%d %H:%M:%S"),
            meta.kind,
            meta.files.len(),
            format_size(meta.total_size),
            payload_note
        );
        println!("      {}", meta.description.dimmed());
    }
}

pub fn print_events(events: &[EngineEvent]) {
    if events.is_empty() {
        println!("No recorded events.");
        return;
    }

    for event in events {
        let time = event.timestamp.format("%Y-%m-%d %H:%M:%S");
        let line = format!("{}  {}", time, event.summary());
        match event.kind.severity() {
            Severity::Info => println!("{}", line),
            Severity::Warning => println!("{}", line.yellow()),
            Severity::Critical => println!("{}", line.red().bold()),
        }
        if let Some(detail) = &event.detail {
            println!("    {}", detail.dimmed());
        }
    }
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(300), "5m 0s");
        assert_eq!(format_duration(3720), "1h 2m");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
    }
}
