//! Payload producers - pluggable non-file state captured alongside snapshots
//!
//! A producer backs up whatever it knows about (container volumes, database
//! dumps) into the snapshot's payload directory and can restore it later.
//! The snapshot store is agnostic to what a producer contains; producer
//! failures are recorded in the manifest and never abort the file capture.

use anyhow::{bail, Context, Result};
use revertit_common::config::DockerConfig;
use revertit_common::PayloadEntry;
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

/// Capability interface for snapshot payload backends. New backends register
/// in the producer list without the store or engine changing.
pub trait PayloadProducer: Send + Sync {
    /// Stable name, used as the payload subdirectory.
    fn name(&self) -> &'static str;

    /// Human description for manifests and logs.
    fn describe(&self) -> String;

    /// Capture into `dest`, returning one manifest entry per payload.
    /// Per-payload failures are returned as entries with `ok: false`.
    fn capture(&self, dest: &Path) -> Result<Vec<PayloadEntry>>;

    /// Restore previously captured payloads from `src`.
    fn restore(&self, src: &Path) -> Result<()>;
}

/// Build the producer list for the current configuration.
pub fn producers_from_config(docker: &DockerConfig) -> Vec<Box<dyn PayloadProducer>> {
    let mut producers: Vec<Box<dyn PayloadProducer>> = Vec::new();
    if docker.backup_volumes {
        producers.push(Box::new(DockerVolumeProducer {
            volumes: docker.volumes.clone(),
            exclude: docker.exclude_volumes.clone(),
        }));
    }
    producers
}

/// Backs up Docker named volumes as tarballs, via a throwaway container that
/// mounts the volume read-only.
pub struct DockerVolumeProducer {
    /// Volumes to capture; empty means everything docker reports.
    volumes: Vec<String>,
    exclude: Vec<String>,
}

impl DockerVolumeProducer {
    fn list_volumes(&self) -> Result<Vec<String>> {
        let output = Command::new("docker")
            .args(["volume", "ls", "--format", "{{.Name}}"])
            .output()
            .context("Failed to run docker volume ls")?;

        if !output.status.success() {
            bail!(
                "docker volume ls failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let all: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let selected = all
            .into_iter()
            .filter(|v| !self.exclude.contains(v))
            .filter(|v| self.volumes.is_empty() || self.volumes.contains(v))
            .collect();

        Ok(selected)
    }

    fn backup_volume(&self, volume: &str, dest: &Path) -> Result<u64> {
        let archive = format!("/backup/{}.tar.gz", volume);
        let output = Command::new("docker")
            .args([
                "run",
                "--rm",
                "-v",
                &format!("{}:/volume:ro", volume),
                "-v",
                &format!("{}:/backup", dest.display()),
                "alpine",
                "tar",
                "-czf",
                &archive,
                "-C",
                "/volume",
                ".",
            ])
            .output()
            .context("Failed to run docker volume backup")?;

        if !output.status.success() {
            bail!(
                "volume backup failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let size = std::fs::metadata(dest.join(format!("{}.tar.gz", volume)))
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(size)
    }

    fn restore_volume(&self, volume: &str, src: &Path) -> Result<()> {
        let archive = format!("/backup/{}.tar.gz", volume);
        let output = Command::new("docker")
            .args([
                "run",
                "--rm",
                "-v",
                &format!("{}:/volume", volume),
                "-v",
                &format!("{}:/backup:ro", src.display()),
                "alpine",
                "sh",
                "-c",
                &format!("rm -rf /volume/* && tar -xzf {} -C /volume", archive),
            ])
            .output()
            .context("Failed to run docker volume restore")?;

        if !output.status.success() {
            bail!(
                "volume restore failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl PayloadProducer for DockerVolumeProducer {
    fn name(&self) -> &'static str {
        "docker_volumes"
    }

    fn describe(&self) -> String {
        if self.volumes.is_empty() {
            "all docker volumes".to_string()
        } else {
            format!("docker volumes: {}", self.volumes.join(", "))
        }
    }

    fn capture(&self, dest: &Path) -> Result<Vec<PayloadEntry>> {
        std::fs::create_dir_all(dest)?;

        let volumes = self.list_volumes()?;
        info!("Backing up {} docker volumes", volumes.len());

        let mut entries = Vec::new();
        for volume in &volumes {
            match self.backup_volume(volume, dest) {
                Ok(size) => entries.push(PayloadEntry {
                    producer: self.name().to_string(),
                    description: format!("volume {}", volume),
                    ok: true,
                    error: None,
                    size_bytes: size,
                }),
                Err(e) => {
                    warn!("Failed to back up volume {}: {:#}", volume, e);
                    entries.push(PayloadEntry {
                        producer: self.name().to_string(),
                        description: format!("volume {}", volume),
                        ok: false,
                        error: Some(format!("{:#}", e)),
                        size_bytes: 0,
                    });
                }
            }
        }

        Ok(entries)
    }

    fn restore(&self, src: &Path) -> Result<()> {
        let mut failed = Vec::new();

        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(volume) = name.strip_suffix(".tar.gz") else {
                continue;
            };

            if let Err(e) = self.restore_volume(volume, src) {
                warn!("Failed to restore volume {}: {:#}", volume, e);
                failed.push(volume.to_string());
            }
        }

        if !failed.is_empty() {
            bail!("failed to restore volumes: {}", failed.join(", "));
        }
        Ok(())
    }
}
