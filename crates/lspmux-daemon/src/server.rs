//! The spawned language-server child.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use lspmux_registry::{resolve_binary, ResolveError, ServerSpec};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// How the server child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Failure to spawn the server child.
#[derive(Debug)]
pub enum SpawnError {
    Resolve(ResolveError),
    Io(std::io::Error),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "failed to spawn server: {e}"),
        }
    }
}

impl std::error::Error for SpawnError {}

impl From<ResolveError> for SpawnError {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}

impl From<std::io::Error> for SpawnError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// An already-spawned server the mux takes ownership of.
///
/// Production hands the mux a real child process; tests hand it the two
/// halves of an in-memory duplex stream and script the server side.
pub struct ServerHandle {
    pub(crate) stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) child: Option<Child>,
}

impl ServerHandle {
    /// Resolve the spec's binary and spawn it in stdio LSP mode.
    pub fn spawn(spec: &ServerSpec, project_root: &Path) -> Result<Self, SpawnError> {
        let binary = resolve_binary(spec, project_root)?;
        info!(server = spec.name, binary = %binary.display(), "spawning language server");

        let mut child = Command::new(&binary)
            .args(spec.args)
            .current_dir(project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;

        // Drain stderr so the child never blocks on it.
        if let Some(stderr) = child.stderr.take() {
            let server = spec.name;
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                    debug!(server, "server stderr: {}", line.trim_end());
                    line.clear();
                }
            });
        }

        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }

    /// Wrap raw streams as a server, with no real process behind them.
    pub fn from_streams(
        stdout: impl AsyncRead + Send + Unpin + 'static,
        stdin: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: None,
        }
    }
}
