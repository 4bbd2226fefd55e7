//! Daemon lifecycle: socket acceptor and state-directory upkeep.

use std::fmt;
use std::path::{Path, PathBuf};

use lspmux_registry::ServerSpec;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::mux::{Mux, MuxConfig};
use crate::paths::{self, DaemonMeta};
use crate::server::{ExitInfo, ServerHandle, SpawnError};

/// Failure to bring the daemon up.
#[derive(Debug)]
pub enum DaemonError {
    Spawn(SpawnError),
    Io(std::io::Error),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "daemon i/o error: {e}"),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<SpawnError> for DaemonError {
    fn from(e: SpawnError) -> Self {
        Self::Spawn(e)
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Idle-shutdown override, in milliseconds.
const IDLE_ENV: &str = "LSPMUX_IDLE_MS";

fn mux_config() -> MuxConfig {
    let mut config = MuxConfig::default();
    if let Some(ms) = std::env::var(IDLE_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        config.idle_shutdown = std::time::Duration::from_millis(ms);
    }
    config
}

/// Spawn the server child, bind the socket, and accept clients until the
/// mux shuts down. Returns how the server child ended.
pub async fn run_daemon(
    spec: &'static ServerSpec,
    project_root: PathBuf,
    socket_path: PathBuf,
) -> Result<ExitInfo, DaemonError> {
    let dir = socket_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;
    paths::write_pid(&dir)?;
    let mut meta = DaemonMeta {
        server: spec.name.to_string(),
        project_root: project_root.clone(),
        socket_path: socket_path.clone(),
        updated_at: paths::now_ms(),
    };
    paths::write_meta(&dir, &meta)?;

    let server = ServerHandle::spawn(spec, &project_root)?;

    let (exit_tx, mut exit_rx) = oneshot::channel();
    let mux = Mux::start(
        spec,
        project_root,
        server,
        mux_config(),
        Box::new(move |info| {
            let _ = exit_tx.send(info);
        }),
    );

    // A leftover socket from a dead daemon would fail the bind.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    // Refresh the record so `updatedAt` marks the moment the socket came up.
    meta.updated_at = paths::now_ms();
    paths::write_meta(&dir, &meta)?;
    info!(socket = %socket_path.display(), "daemon listening");

    let exit = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => mux.attach_client(stream),
                    Err(e) => warn!(error = %e, "failed to accept client"),
                }
            }
            exit = &mut exit_rx => {
                break exit.unwrap_or_default();
            }
        }
    };

    info!(%exit, "daemon stopping");
    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(error = %e, "failed to remove socket file");
    }
    Ok(exit)
}
