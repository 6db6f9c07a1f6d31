//! Configuration for the revertit daemon.
//!
//! Loads settings from /etc/revertit/config.toml or uses defaults.
//! Every field has a serde default so a partial file is always valid.

use crate::types::ChangeCategory;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/revertit/config.toml";

/// Confirmation timeout policy for one category: a fixed number of seconds,
/// or a 5-field cron expression whose next occurrence becomes the deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeoutPolicy {
    Secs(u64),
    Cron(String),
}

/// What to do when a change event arrives for a resource that already has a
/// pending change: refresh its deadline, or leave it untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    Extend,
    Ignore,
}

/// Paths to monitor, grouped by category. Entries may be concrete paths or
/// glob patterns; patterns are re-expanded on every scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_network_configs")]
    pub network_configs: Vec<String>,

    #[serde(default = "default_ssh_configs")]
    pub ssh_configs: Vec<String>,

    #[serde(default = "default_firewall_configs")]
    pub firewall_configs: Vec<String>,

    #[serde(default = "default_service_configs")]
    pub service_configs: Vec<String>,

    #[serde(default)]
    pub custom_paths: Vec<String>,

    /// Window within which a burst of events on one path collapses to a
    /// single change.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Fingerprint scan interval for the polling fallback and for glob
    /// re-expansion.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Force polling even where native change notification is available.
    #[serde(default)]
    pub force_polling: bool,
}

fn default_network_configs() -> Vec<String> {
    vec![
        "/etc/network/interfaces".to_string(),
        "/etc/netplan/*.yaml".to_string(),
        "/etc/NetworkManager/system-connections/*".to_string(),
        "/etc/systemd/network/*".to_string(),
    ]
}

fn default_ssh_configs() -> Vec<String> {
    vec![
        "/etc/ssh/sshd_config".to_string(),
        "/etc/ssh/sshd_config.d/*".to_string(),
    ]
}

fn default_firewall_configs() -> Vec<String> {
    vec![
        "/etc/iptables/rules.v4".to_string(),
        "/etc/iptables/rules.v6".to_string(),
        "/etc/ufw/*.rules".to_string(),
    ]
}

fn default_service_configs() -> Vec<String> {
    vec!["/etc/systemd/system/*.service".to_string()]
}

fn default_debounce_secs() -> u64 {
    2
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            network_configs: default_network_configs(),
            ssh_configs: default_ssh_configs(),
            firewall_configs: default_firewall_configs(),
            service_configs: default_service_configs(),
            custom_paths: Vec::new(),
            debounce_secs: default_debounce_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            force_polling: false,
        }
    }
}

impl MonitoringConfig {
    /// All configured patterns with the category each belongs to. Custom
    /// paths are categorized by their path keywords.
    pub fn patterns(&self) -> Vec<(String, ChangeCategory)> {
        let mut out = Vec::new();
        for p in &self.network_configs {
            out.push((p.clone(), ChangeCategory::Network));
        }
        for p in &self.ssh_configs {
            out.push((p.clone(), ChangeCategory::Ssh));
        }
        for p in &self.firewall_configs {
            out.push((p.clone(), ChangeCategory::Firewall));
        }
        for p in &self.service_configs {
            out.push((p.clone(), ChangeCategory::Service));
        }
        for p in &self.custom_paths {
            out.push((p.clone(), ChangeCategory::from_path(Path::new(p))));
        }
        out
    }
}

/// Per-category confirmation deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_network_timeout")]
    pub network: TimeoutPolicy,

    #[serde(default = "default_ssh_timeout")]
    pub ssh: TimeoutPolicy,

    #[serde(default = "default_firewall_timeout")]
    pub firewall: TimeoutPolicy,

    #[serde(default = "default_service_timeout")]
    pub service: TimeoutPolicy,

    #[serde(default = "default_system_timeout")]
    pub system: TimeoutPolicy,

    /// Fixed-duration policies are clamped to this range.
    #[serde(default = "default_min_timeout_secs")]
    pub min_secs: u64,

    #[serde(default = "default_max_timeout_secs")]
    pub max_secs: u64,

    #[serde(default = "default_pending_policy")]
    pub on_pending_change: PendingPolicy,
}

fn default_network_timeout() -> TimeoutPolicy {
    TimeoutPolicy::Secs(600)
}

fn default_ssh_timeout() -> TimeoutPolicy {
    TimeoutPolicy::Secs(900)
}

fn default_firewall_timeout() -> TimeoutPolicy {
    TimeoutPolicy::Secs(300)
}

fn default_service_timeout() -> TimeoutPolicy {
    TimeoutPolicy::Secs(300)
}

fn default_system_timeout() -> TimeoutPolicy {
    TimeoutPolicy::Secs(300)
}

fn default_min_timeout_secs() -> u64 {
    60
}

fn default_max_timeout_secs() -> u64 {
    1800
}

fn default_pending_policy() -> PendingPolicy {
    PendingPolicy::Extend
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            network: default_network_timeout(),
            ssh: default_ssh_timeout(),
            firewall: default_firewall_timeout(),
            service: default_service_timeout(),
            system: default_system_timeout(),
            min_secs: default_min_timeout_secs(),
            max_secs: default_max_timeout_secs(),
            on_pending_change: default_pending_policy(),
        }
    }
}

impl TimeoutConfig {
    /// Policy for a category, with fixed durations clamped to the
    /// configured bounds.
    pub fn policy_for(&self, category: ChangeCategory) -> TimeoutPolicy {
        let policy = match category {
            ChangeCategory::Network => &self.network,
            ChangeCategory::Ssh => &self.ssh,
            ChangeCategory::Firewall => &self.firewall,
            ChangeCategory::Service => &self.service,
            ChangeCategory::System => &self.system,
        };

        match policy {
            TimeoutPolicy::Secs(s) => {
                TimeoutPolicy::Secs((*s).clamp(self.min_secs, self.max_secs))
            }
            TimeoutPolicy::Cron(expr) => TimeoutPolicy::Cron(expr.clone()),
        }
    }
}

/// Snapshot storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_location")]
    pub location: PathBuf,

    /// Oldest unreferenced snapshots beyond this count are deleted after
    /// each successful capture.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

fn default_snapshot_location() -> PathBuf {
    PathBuf::from("/var/lib/revertit/snapshots")
}

fn default_max_snapshots() -> usize {
    10
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            location: default_snapshot_location(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

/// Command pair run after a successful restore for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHook {
    pub restart: String,
    #[serde(default)]
    pub verify: Option<String>,
}

/// Revert behavior: restore retries, connectivity diagnostics, service hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertConfig {
    /// Restore attempts before the change is marked revert_failed.
    #[serde(default = "default_restore_attempts")]
    pub restore_attempts: u32,

    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Probe connectivity on expiry and log whether the change appears to
    /// have broken it. Diagnostic only.
    #[serde(default = "default_connectivity_check")]
    pub connectivity_check: bool,

    #[serde(default = "default_connectivity_endpoints")]
    pub connectivity_endpoints: Vec<String>,

    #[serde(default = "default_connectivity_timeout_secs")]
    pub connectivity_timeout_secs: u64,

    /// Per-category restart/verify commands, keyed by category name.
    #[serde(default = "default_service_hooks")]
    pub service_hooks: HashMap<String, ServiceHook>,
}

fn default_restore_attempts() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_connectivity_check() -> bool {
    true
}

fn default_connectivity_endpoints() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_connectivity_timeout_secs() -> u64 {
    10
}

fn default_service_hooks() -> HashMap<String, ServiceHook> {
    let mut hooks = HashMap::new();
    hooks.insert(
        "network".to_string(),
        ServiceHook {
            restart: "systemctl restart networking".to_string(),
            verify: Some("ip link show".to_string()),
        },
    );
    hooks.insert(
        "ssh".to_string(),
        ServiceHook {
            restart: "systemctl restart ssh".to_string(),
            verify: Some("systemctl is-active ssh".to_string()),
        },
    );
    hooks.insert(
        "firewall".to_string(),
        ServiceHook {
            restart: "ufw reload".to_string(),
            verify: Some("ufw status".to_string()),
        },
    );
    hooks.insert(
        "service".to_string(),
        ServiceHook {
            restart: "systemctl daemon-reload".to_string(),
            verify: None,
        },
    );
    hooks
}

impl Default for RevertConfig {
    fn default() -> Self {
        Self {
            restore_attempts: default_restore_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            connectivity_check: default_connectivity_check(),
            connectivity_endpoints: default_connectivity_endpoints(),
            connectivity_timeout_secs: default_connectivity_timeout_secs(),
            service_hooks: default_service_hooks(),
        }
    }
}

impl RevertConfig {
    pub fn hook_for(&self, category: ChangeCategory) -> Option<&ServiceHook> {
        self.service_hooks.get(category.as_str())
    }
}

/// Optional Docker payload capture alongside file snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub backup_volumes: bool,

    /// Volumes to capture; empty means every volume docker reports.
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub exclude_volumes: Vec<String>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub snapshots: SnapshotConfig,

    #[serde(default)]
    pub revert: RevertConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    /// Root for pending-change records and the audit event log.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/revertit/state")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitoring: MonitoringConfig::default(),
            timeouts: TimeoutConfig::default(),
            snapshots: SnapshotConfig::default(),
            revert: RevertConfig::default(),
            docker: DockerConfig::default(),
            state_dir: default_state_dir(),
        }
    }
}

impl Config {
    /// Load from the default path, falling back to defaults when the file is
    /// absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.state_dir.join("pending")
    }

    pub fn events_log(&self) -> PathBuf {
        self.state_dir.join("events.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_clamped() {
        let config = TimeoutConfig::default();
        assert_eq!(
            config.policy_for(ChangeCategory::Ssh),
            TimeoutPolicy::Secs(900)
        );
        assert_eq!(
            config.policy_for(ChangeCategory::Firewall),
            TimeoutPolicy::Secs(300)
        );
    }

    #[test]
    fn test_out_of_range_timeout_clamps() {
        let config = TimeoutConfig {
            network: TimeoutPolicy::Secs(5),
            ssh: TimeoutPolicy::Secs(86400),
            ..Default::default()
        };
        assert_eq!(
            config.policy_for(ChangeCategory::Network),
            TimeoutPolicy::Secs(60)
        );
        assert_eq!(
            config.policy_for(ChangeCategory::Ssh),
            TimeoutPolicy::Secs(1800)
        );
    }

    #[test]
    fn test_parse_mixed_timeout_policies() {
        let toml_str = r#"
            [timeouts]
            firewall = 120
            service = "0 3 * * *"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.timeouts.policy_for(ChangeCategory::Firewall),
            TimeoutPolicy::Secs(120)
        );
        assert_eq!(
            config.timeouts.policy_for(ChangeCategory::Service),
            TimeoutPolicy::Cron("0 3 * * *".to_string())
        );
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.snapshots.max_snapshots, 10);
        assert_eq!(config.timeouts.on_pending_change, PendingPolicy::Extend);
    }

    #[test]
    fn test_patterns_cover_all_groups() {
        let monitoring = MonitoringConfig {
            custom_paths: vec!["/etc/hosts".to_string()],
            ..Default::default()
        };
        let patterns = monitoring.patterns();
        assert!(patterns
            .iter()
            .any(|(p, c)| p == "/etc/ssh/sshd_config" && *c == ChangeCategory::Ssh));
        assert!(patterns
            .iter()
            .any(|(p, c)| p == "/etc/hosts" && *c == ChangeCategory::System));
    }

    #[test]
    fn test_default_hooks_per_category() {
        let revert = RevertConfig::default();
        assert!(revert.hook_for(ChangeCategory::Firewall).is_some());
        assert!(revert.hook_for(ChangeCategory::System).is_none());
    }
}
