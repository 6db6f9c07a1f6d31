//! Content fingerprints for monitored files.
//!
//! SHA-256 of the content where the file is readable; mtime+size where the
//! open fails but metadata is available; Missing for absent paths. Two
//! fingerprints differing is what the watcher treats as a change.

use revertit_common::Fingerprint;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Fingerprint content held in memory, matching what `fingerprint` would
/// produce for a file with these bytes.
pub fn fingerprint_bytes(content: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(content);
    Fingerprint::Sha256(hex::encode(hasher.finalize()))
}

/// Fingerprint a path as it exists right now.
pub fn fingerprint(path: &Path) -> Fingerprint {
    if !path.exists() {
        return Fingerprint::Missing;
    }

    match std::fs::read(path) {
        Ok(content) => {
            let mut hasher = Sha256::new();
            hasher.update(&content);
            Fingerprint::Sha256(hex::encode(hasher.finalize()))
        }
        Err(e) => {
            debug!("Cannot hash {}: {}, falling back to metadata", path.display(), e);
            match std::fs::metadata(path) {
                Ok(meta) => {
                    let mtime_unix = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    Fingerprint::Meta {
                        mtime_unix,
                        size: meta.len(),
                    }
                }
                Err(_) => Fingerprint::Missing,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");

        std::fs::write(&path, "a").unwrap();
        let first = fingerprint(&path);

        std::fs::write(&path, "b").unwrap();
        let second = fingerprint(&path);

        assert_ne!(first, second);
        assert!(matches!(first, Fingerprint::Sha256(_)));
    }

    #[test]
    fn test_fingerprint_stable_for_same_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");
        std::fs::write(&path, "same").unwrap();

        assert_eq!(fingerprint(&path), fingerprint(&path));
    }

    #[test]
    fn test_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(fingerprint(&dir.path().join("gone")), Fingerprint::Missing);
    }
}
