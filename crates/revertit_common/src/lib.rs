//! RevertIT Common - Shared types and protocol for the revertit daemon and CLI
//!
//! Timed confirmation for system configuration changes: a change that is not
//! confirmed before its deadline is automatically reverted from a snapshot.

pub mod config;
pub mod events;
pub mod ipc;
pub mod paths;
pub mod types;

pub use config::Config;
pub use types::*;

use std::io;
use std::path::Path;

/// Write a file atomically: write to a sibling tmp file, then rename over the
/// target. Readers never observe a partially written record.
pub fn atomic_write(path: &Path, content: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");

        atomic_write(&path, "first").unwrap();
        atomic_write(&path, "second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
