//! `ps`, `kill`, and `prune` — daemon management through state directories.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use lspmux_daemon::paths;
use serde::Serialize;
use tracing::{debug, warn};

use crate::CliError;

/// Daemon status as reported by `ps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    /// Socket accepts connections.
    Listening,
    /// Process alive but socket not accepting.
    Running,
    /// Recorded process is dead.
    Stale,
}

#[derive(Debug, Serialize)]
struct PsEntry {
    server: String,
    #[serde(rename = "projectRoot")]
    project_root: PathBuf,
    pid: Option<i32>,
    status: Status,
    #[serde(rename = "updatedAt")]
    updated_at: u64,
}

/// Every daemon state directory, with its metadata when readable.
fn daemon_dirs() -> Vec<(PathBuf, Option<paths::DaemonMeta>)> {
    daemon_dirs_in(&paths::state_root())
}

fn daemon_dirs_in(root: &Path) -> Vec<(PathBuf, Option<paths::DaemonMeta>)> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<_> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| {
            let dir = entry.path();
            let meta = paths::read_meta(&dir);
            (dir, meta)
        })
        .collect();
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    dirs
}

async fn status_of(dir: &std::path::Path, meta: Option<&paths::DaemonMeta>) -> Status {
    let socket = meta
        .map(|m| m.socket_path.clone())
        .unwrap_or_else(|| dir.join(paths::SOCKET_FILE));
    if paths::socket_alive(&socket).await {
        return Status::Listening;
    }
    match paths::read_pid(dir) {
        Some(pid) if paths::pid_alive(pid) => Status::Running,
        _ => Status::Stale,
    }
}

pub(crate) async fn ps(json: bool) -> Result<ExitCode, CliError> {
    let mut entries = Vec::new();
    for (dir, meta) in daemon_dirs() {
        let status = status_of(&dir, meta.as_ref()).await;
        let pid = paths::read_pid(&dir);
        let (server, project_root, updated_at) = match meta {
            Some(meta) => (meta.server, meta.project_root, meta.updated_at),
            None => ("<unknown>".to_string(), dir.clone(), 0),
        };
        entries.push(PsEntry {
            server,
            project_root,
            pid,
            status,
            updated_at,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries).map_err(|e| CliError(e.to_string()))?);
        return Ok(ExitCode::SUCCESS);
    }

    if entries.is_empty() {
        println!("no daemons");
        return Ok(ExitCode::SUCCESS);
    }
    println!("{:<10} {:<9} {:<8} PROJECT", "SERVER", "STATUS", "PID");
    for entry in &entries {
        let pid = entry
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = match entry.status {
            Status::Listening => "listening",
            Status::Running => "running",
            Status::Stale => "stale",
        };
        println!(
            "{:<10} {:<9} {:<8} {}",
            entry.server,
            status,
            pid,
            entry.project_root.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) async fn kill(
    server: Option<&str>,
    project: Option<PathBuf>,
    all: bool,
) -> Result<ExitCode, CliError> {
    let targets: Vec<PathBuf> = if all {
        daemon_dirs().into_iter().map(|(dir, _)| dir).collect()
    } else {
        let Some(server) = server else {
            // Usage error, same exit code clap uses.
            eprintln!("lspmux: kill requires a server name or --all");
            return Ok(ExitCode::from(2));
        };
        let spec = lspmux_registry::lookup(server)?;
        let project_root = match project {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        let project_root = project_root.canonicalize().unwrap_or(project_root);
        vec![paths::daemon_dir(spec.name, &project_root)]
    };

    let (killed, failures) = kill_dirs(&targets);

    if failures > 0 {
        return Err(CliError(format!("{failures} daemon(s) could not be signalled")));
    }
    if killed == 0 && !all {
        return Err(CliError("no running daemon found".to_string()));
    }
    Ok(ExitCode::SUCCESS)
}

/// SIGTERM every live pid recorded under the given directories.
/// Returns how many were signalled and how many signals failed.
fn kill_dirs(targets: &[PathBuf]) -> (usize, usize) {
    let mut killed = 0usize;
    let mut failures = 0usize;
    for dir in targets {
        match paths::read_pid(dir) {
            Some(pid) if paths::pid_alive(pid) => {
                if let Err(e) = terminate(pid) {
                    warn!(pid, error = %e, "failed to signal daemon");
                    failures += 1;
                } else {
                    println!("killed pid {pid} ({})", dir.display());
                    killed += 1;
                }
            }
            Some(pid) => debug!(pid, dir = %dir.display(), "daemon already dead"),
            None => debug!(dir = %dir.display(), "no pid file"),
        }
    }
    (killed, failures)
}

#[cfg(unix)]
fn terminate(pid: i32) -> Result<(), nix::errno::Errno> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
}

#[cfg(not(unix))]
fn terminate(_pid: i32) -> Result<(), std::io::Error> {
    Err(std::io::Error::other("kill is only supported on unix"))
}

pub(crate) async fn prune() -> Result<ExitCode, CliError> {
    let removed = prune_in(&paths::state_root()).await;
    println!("pruned {removed} daemon director{}", if removed == 1 { "y" } else { "ies" });
    Ok(ExitCode::SUCCESS)
}

/// Remove every stale daemon directory under `root`; returns the count.
async fn prune_in(root: &Path) -> usize {
    let mut removed = 0usize;
    for (dir, meta) in daemon_dirs_in(root) {
        let status = status_of(&dir, meta.as_ref()).await;
        if status == Status::Stale {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {
                    println!("pruned {}", dir.display());
                    removed += 1;
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to prune"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use lspmux_daemon::paths::{DaemonMeta, PID_FILE, SOCKET_FILE};

    const DEAD_PID: i32 = 999_999_999;

    #[tokio::test]
    async fn status_is_stale_for_an_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(status_of(dir.path(), None).await, Status::Stale);
    }

    #[tokio::test]
    async fn status_is_stale_for_a_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PID_FILE), DEAD_PID.to_string()).unwrap();
        assert_eq!(status_of(dir.path(), None).await, Status::Stale);
    }

    #[tokio::test]
    async fn status_is_running_for_a_live_pid_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PID_FILE), std::process::id().to_string()).unwrap();
        assert_eq!(status_of(dir.path(), None).await, Status::Running);
    }

    #[tokio::test]
    async fn status_is_listening_when_the_socket_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(SOCKET_FILE);
        let _listener = tokio::net::UnixListener::bind(&socket).unwrap();

        // Even with a dead recorded pid, an accepting socket wins.
        std::fs::write(dir.path().join(PID_FILE), DEAD_PID.to_string()).unwrap();
        let meta = DaemonMeta {
            server: "tsgo".into(),
            project_root: "/proj".into(),
            socket_path: socket,
            updated_at: 1,
        };
        assert_eq!(status_of(dir.path(), Some(&meta)).await, Status::Listening);
    }

    #[test]
    fn daemon_dirs_lists_subdirs_sorted_with_meta() {
        let root = tempfile::tempdir().unwrap();
        let second = root.path().join("bbbb");
        std::fs::create_dir(&second).unwrap();
        let first = root.path().join("aaaa");
        std::fs::create_dir(&first).unwrap();
        lspmux_daemon::paths::write_meta(
            &first,
            &DaemonMeta {
                server: "oxlint".into(),
                project_root: "/proj".into(),
                socket_path: first.join(SOCKET_FILE),
                updated_at: 7,
            },
        )
        .unwrap();
        // Plain files at the root are not daemon directories.
        std::fs::write(root.path().join("stray.txt"), "noise").unwrap();

        let dirs = daemon_dirs_in(root.path());
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].0, first);
        assert_eq!(dirs[0].1.as_ref().unwrap().server, "oxlint");
        assert_eq!(dirs[1].0, second);
        assert!(dirs[1].1.is_none());
    }

    #[test]
    fn daemon_dirs_is_empty_when_root_is_missing() {
        let root = tempfile::tempdir().unwrap();
        let gone = root.path().join("never-created");
        assert!(daemon_dirs_in(&gone).is_empty());
    }

    #[test]
    fn kill_dirs_skips_dead_and_missing_pids() {
        let root = tempfile::tempdir().unwrap();
        let dead = root.path().join("dead");
        std::fs::create_dir(&dead).unwrap();
        std::fs::write(dead.join(PID_FILE), DEAD_PID.to_string()).unwrap();
        let empty = root.path().join("empty");
        std::fs::create_dir(&empty).unwrap();

        assert_eq!(kill_dirs(&[dead, empty]), (0, 0));
    }

    #[cfg(unix)]
    #[test]
    fn kill_dirs_terminates_a_live_process() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("live");
        std::fs::create_dir(&dir).unwrap();

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("sleep should spawn");
        std::fs::write(dir.join(PID_FILE), child.id().to_string()).unwrap();

        assert_eq!(kill_dirs(&[dir]), (1, 0));
        let status = child.wait().unwrap();
        assert!(!status.success(), "child should die to SIGTERM");
    }

    #[tokio::test]
    async fn prune_removes_only_stale_dirs() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("stale");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join(PID_FILE), DEAD_PID.to_string()).unwrap();
        let running = root.path().join("running");
        std::fs::create_dir(&running).unwrap();
        std::fs::write(running.join(PID_FILE), std::process::id().to_string()).unwrap();

        assert_eq!(prune_in(root.path()).await, 1);
        assert!(!stale.exists());
        assert!(running.exists());
    }
}
