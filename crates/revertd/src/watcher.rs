//! Path watcher - turns raw filesystem noise into settled change events
//!
//! Native notifications mark paths dirty; a path is emitted as one
//! ChangeEvent once it has been quiet for the debounce window, carrying the
//! fingerprint delta from before the burst to after it settled. A periodic
//! scan re-expands glob patterns (new matches become created events) and
//! doubles as the polling fallback for filesystems without notification
//! support. Unreadable paths are logged and skipped, never fatal.

use crate::fingerprint::fingerprint;
use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use revertit_common::config::MonitoringConfig;
use revertit_common::{ChangeCategory, ChangeEvent, ChangeKind, Fingerprint, WatchedResource};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PathWatcher {
    patterns: Vec<(String, ChangeCategory)>,
    debounce: Duration,
    poll_interval: Duration,
    force_polling: bool,
}

impl PathWatcher {
    pub fn from_config(config: &MonitoringConfig) -> Self {
        Self::new(
            config.patterns(),
            Duration::from_secs(config.debounce_secs),
            Duration::from_secs(config.poll_interval_secs),
            config.force_polling,
        )
    }

    pub fn new(
        patterns: Vec<(String, ChangeCategory)>,
        debounce: Duration,
        poll_interval: Duration,
        force_polling: bool,
    ) -> Self {
        Self {
            patterns,
            debounce,
            poll_interval,
            force_polling,
        }
    }

    /// Expand all configured patterns to the concrete paths matching right
    /// now. Non-glob entries are kept even when absent so their creation is
    /// observed.
    pub fn expand(&self) -> Vec<(PathBuf, ChangeCategory)> {
        expand_patterns(&self.patterns)
    }

    /// Start watching, emitting settled events into `tx`. The returned
    /// handle can be aborted and the watcher re-spawned later with the same
    /// pattern set; fingerprints are re-read at startup so nothing is lost
    /// across the gap.
    pub fn spawn(self, tx: mpsc::Sender<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(tx).await;
        })
    }

    async fn run(self, tx: mpsc::Sender<ChangeEvent>) {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();

        // Keep the native watcher alive for the life of the loop; fall back
        // to pure polling when registration fails.
        let _native = if self.force_polling {
            None
        } else {
            match self.register_native(raw_tx) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("Native watch unavailable ({}), using polling only", e);
                    None
                }
            }
        };

        let mut resources: HashMap<PathBuf, WatchedResource> = HashMap::new();
        for (path, category) in self.expand() {
            let fp = fingerprint(&path);
            resources.insert(
                path.clone(),
                WatchedResource {
                    path,
                    category,
                    fingerprint: fp,
                },
            );
        }
        info!("Watching {} paths", resources.len());

        let mut dirty: HashMap<PathBuf, Instant> = HashMap::new();
        let tick = self.debounce.min(Duration::from_millis(500)).max(Duration::from_millis(10));
        let mut debounce_tick = tokio::time::interval(tick);
        let mut scan_tick = tokio::time::interval(self.poll_interval);
        scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                raw = raw_rx.recv() => {
                    match raw {
                        Some(path) => {
                            if resources.contains_key(&path) || self.matches_any(&path) {
                                dirty.insert(path, Instant::now());
                            }
                        }
                        None => break,
                    }
                }
                _ = debounce_tick.tick() => {
                    let settled: Vec<PathBuf> = dirty
                        .iter()
                        .filter(|(_, t)| t.elapsed() >= self.debounce)
                        .map(|(p, _)| p.clone())
                        .collect();

                    for path in settled {
                        dirty.remove(&path);
                        self.check_path(&path, &mut resources, &tx).await;
                    }
                }
                _ = scan_tick.tick() => {
                    self.scan(&mut resources, &mut dirty, &tx).await;
                }
            }
        }
    }

    fn register_native(
        &self,
        raw_tx: mpsc::UnboundedSender<PathBuf>,
    ) -> notify::Result<RecommendedWatcher> {
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        for path in event.paths {
                            let _ = raw_tx.send(path);
                        }
                    }
                    Err(e) => warn!("Watch error: {:?}", e),
                }
            })?;

        let mut registered = 0;
        for dir in watch_dirs(&self.patterns) {
            if !dir.exists() {
                debug!("Watch dir {} does not exist, skipping", dir.display());
                continue;
            }
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => registered += 1,
                Err(e) => warn!("Cannot watch {}: {}", dir.display(), e),
            }
        }
        info!("Native watcher registered on {} directories", registered);
        Ok(watcher)
    }

    fn matches_any(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.patterns.iter().any(|(pattern, _)| {
            if pattern.contains('*') || pattern.contains('?') {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(&text))
                    .unwrap_or(false)
            } else {
                Path::new(pattern) == path
            }
        })
    }

    fn category_of(&self, path: &Path) -> ChangeCategory {
        let text = path.to_string_lossy();
        for (pattern, category) in &self.patterns {
            let matched = if pattern.contains('*') || pattern.contains('?') {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(&text))
                    .unwrap_or(false)
            } else {
                Path::new(pattern) == path
            };
            if matched {
                return *category;
            }
        }
        ChangeCategory::from_path(path)
    }

    /// Fingerprint one path and emit an event if it differs from the last
    /// observed state.
    async fn check_path(
        &self,
        path: &Path,
        resources: &mut HashMap<PathBuf, WatchedResource>,
        tx: &mpsc::Sender<ChangeEvent>,
    ) {
        let current = fingerprint(path);

        let previous = match resources.get(path) {
            Some(resource) => resource.fingerprint.clone(),
            None => Fingerprint::Missing,
        };

        if previous == current {
            return;
        }

        let kind = match (&previous, &current) {
            (Fingerprint::Missing, _) => ChangeKind::Created,
            (_, Fingerprint::Missing) => ChangeKind::Deleted,
            _ => ChangeKind::Modified,
        };

        let category = resources
            .get(path)
            .map(|r| r.category)
            .unwrap_or_else(|| self.category_of(path));

        let event = ChangeEvent {
            path: path.to_path_buf(),
            category,
            kind,
            detected_at: Utc::now(),
            previous: previous.clone(),
            current: current.clone(),
        };

        debug!("Change settled: {} ({})", path.display(), kind);

        // Record the new state before handing the event off.
        resources.insert(
            path.to_path_buf(),
            WatchedResource {
                path: path.to_path_buf(),
                category,
                fingerprint: current,
            },
        );

        if tx.send(event).await.is_err() {
            warn!("Event channel closed, dropping change for {}", path.display());
        }
    }

    /// Full scan: re-expand globs so new files join the watch set, and
    /// compare every known fingerprint (the polling fallback).
    async fn scan(
        &self,
        resources: &mut HashMap<PathBuf, WatchedResource>,
        dirty: &mut HashMap<PathBuf, Instant>,
        tx: &mpsc::Sender<ChangeEvent>,
    ) {
        for (path, category) in self.expand() {
            resources.entry(path.clone()).or_insert(WatchedResource {
                path,
                category,
                fingerprint: Fingerprint::Missing,
            });
        }

        let paths: Vec<PathBuf> = resources.keys().cloned().collect();
        for path in paths {
            // A path still inside its debounce window settles via the
            // debounce tick instead.
            if dirty.contains_key(&path) {
                continue;
            }
            self.check_path(&path, resources, tx).await;
        }
    }
}

/// Expand pattern strings: glob entries to their current matches, plain
/// paths as themselves.
pub fn expand_patterns(patterns: &[(String, ChangeCategory)]) -> Vec<(PathBuf, ChangeCategory)> {
    let mut out = Vec::new();

    for (pattern, category) in patterns {
        if pattern.contains('*') || pattern.contains('?') {
            match glob::glob(pattern) {
                Ok(matches) => {
                    for m in matches.flatten() {
                        if m.is_file() {
                            out.push((m, *category));
                        }
                    }
                }
                Err(e) => warn!("Bad glob pattern '{}': {}", pattern, e),
            }
        } else {
            out.push((PathBuf::from(pattern), *category));
        }
    }

    out
}

/// Directories to register with the native watcher: the parent of each
/// pattern's longest glob-free prefix.
fn watch_dirs(patterns: &[(String, ChangeCategory)]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    for (pattern, _) in patterns {
        let glob_free: PathBuf = match pattern.find(['*', '?']) {
            Some(idx) => {
                let prefix = &pattern[..idx];
                match prefix.rfind('/') {
                    Some(slash) => PathBuf::from(&prefix[..slash.max(1)]),
                    None => PathBuf::from("."),
                }
            }
            None => {
                let path = PathBuf::from(pattern);
                path.parent().map(|p| p.to_path_buf()).unwrap_or(path)
            }
        };

        if !dirs.contains(&glob_free) {
            dirs.push(glob_free);
        }
    }

    dirs
}
