//! Path helpers for RevertIT
//!
//! Socket and state locations, with an env override so tests and
//! unprivileged runs can relocate everything.

use std::path::PathBuf;

/// Default daemon socket path
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("REVERTD_SOCKET") {
        return PathBuf::from(path);
    }
    PathBuf::from("/run/revertit/revertd.sock")
}

/// Directory holding the daemon socket
pub fn socket_dir() -> PathBuf {
    socket_path()
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/run/revertit"))
}

/// Resolve the socket path with an explicit override taking priority over
/// the environment and the default.
pub fn discover_socket_path(explicit: Option<&str>) -> PathBuf {
    match explicit {
        Some(path) => PathBuf::from(path),
        None => socket_path(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let path = discover_socket_path(Some("/tmp/test.sock"));
        assert_eq!(path, PathBuf::from("/tmp/test.sock"));
    }

    #[test]
    fn test_default_socket_dir() {
        std::env::remove_var("REVERTD_SOCKET");
        assert_eq!(socket_dir(), PathBuf::from("/run/revertit"));
    }
}
