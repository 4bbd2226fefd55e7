//! On-disk daemon state.
//!
//! Every daemon owns one subdirectory under the per-user cache dir, keyed
//! by a truncated SHA-256 of `projectRoot`, a NUL byte, and the server
//! name. The directory holds the local socket, a pid file, a JSON metadata
//! record, and the log file. Only the owning daemon writes here; the
//! management CLI reads or removes whole directories.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SOCKET_FILE: &str = "socket";
pub const PID_FILE: &str = "daemon.pid";
pub const META_FILE: &str = "meta.json";
pub const LOG_FILE: &str = "log.txt";

/// Hex characters kept from the directory-key digest.
const KEY_LEN: usize = 16;

/// Metadata record the management CLI reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonMeta {
    pub server: String,
    pub project_root: PathBuf,
    pub socket_path: PathBuf,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// Root of all daemon state directories.
pub fn state_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lspmux")
}

/// Directory key for one (server, project root) pair.
pub fn daemon_key(server: &str, project_root: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_root.as_os_str().as_encoded_bytes());
    hasher.update([0u8]);
    hasher.update(server.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..KEY_LEN].to_string()
}

/// State directory for one (server, project root) pair.
pub fn daemon_dir(server: &str, project_root: &Path) -> PathBuf {
    state_root().join(daemon_key(server, project_root))
}

pub fn write_meta(dir: &Path, meta: &DaemonMeta) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
    std::fs::write(dir.join(META_FILE), body)
}

pub fn read_meta(dir: &Path) -> Option<DaemonMeta> {
    let body = std::fs::read(dir.join(META_FILE)).ok()?;
    serde_json::from_slice(&body).ok()
}

pub fn write_pid(dir: &Path) -> io::Result<()> {
    std::fs::write(dir.join(PID_FILE), std::process::id().to_string())
}

pub fn read_pid(dir: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(dir.join(PID_FILE)).ok()?;
    content.trim().parse().ok()
}

/// Whether a recorded pid names a live process (signal 0 probe).
#[cfg(unix)]
pub fn pid_alive(pid: i32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i32) -> bool {
    false
}

/// Whether the daemon socket accepts connections right now.
pub async fn socket_alive(path: &Path) -> bool {
    tokio::net::UnixStream::connect(path).await.is_ok()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_truncated() {
        let a = daemon_key("tsgo", Path::new("/home/user/project"));
        let b = daemon_key("tsgo", Path::new("/home/user/project"));
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_separates_server_and_root() {
        // The NUL separator keeps ("ab", "c") distinct from ("a", "bc").
        let joined_one_way = daemon_key("server", Path::new("/p/rootx"));
        let joined_other_way = daemon_key("xserver", Path::new("/p/root"));
        assert_ne!(joined_one_way, joined_other_way);

        assert_ne!(
            daemon_key("tsgo", Path::new("/proj")),
            daemon_key("oxlint", Path::new("/proj"))
        );
        assert_ne!(
            daemon_key("tsgo", Path::new("/proj-a")),
            daemon_key("tsgo", Path::new("/proj-b"))
        );
    }

    #[test]
    fn meta_roundtrip_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let meta = DaemonMeta {
            server: "tsgo".into(),
            project_root: "/home/user/project".into(),
            socket_path: dir.path().join(SOCKET_FILE),
            updated_at: 1_700_000_000_000,
        };
        write_meta(dir.path(), &meta).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(META_FILE)).unwrap()).unwrap();
        assert_eq!(raw["projectRoot"], "/home/user/project");
        assert_eq!(raw["updatedAt"], 1_700_000_000_000u64);
        assert!(raw.get("socketPath").is_some());

        assert_eq!(read_meta(dir.path()).unwrap(), meta);
    }

    #[test]
    fn pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_pid(dir.path()).unwrap();
        assert_eq!(read_pid(dir.path()), Some(std::process::id() as i32));
    }

    #[test]
    fn read_pid_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PID_FILE), "not-a-pid").unwrap();
        assert_eq!(read_pid(dir.path()), None);
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive_and_bogus_pid_is_not() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(999_999_999));
    }

    #[tokio::test]
    async fn socket_alive_reflects_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_FILE);
        assert!(!socket_alive(&path).await);

        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        assert!(socket_alive(&path).await);
    }
}
