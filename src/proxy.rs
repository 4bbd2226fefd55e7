//! `connect` — proxy the caller's stdio to a daemon socket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use lspmux_daemon::paths;
use lspmux_registry::ServerSpec;
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::CliError;

/// How long a freshly spawned daemon gets to start listening.
const STARTUP_BUDGET: Duration = Duration::from_secs(10);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) async fn connect(
    server: &str,
    project: Option<PathBuf>,
) -> Result<ExitCode, CliError> {
    // An unknown server name is a usage error, not an operational one.
    let spec = match lspmux_registry::lookup(server) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("lspmux: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    let project_root = match project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let project_root = project_root.canonicalize().unwrap_or(project_root);

    let dir = paths::daemon_dir(spec.name, &project_root);
    std::fs::create_dir_all(&dir)?;
    let socket = dir.join(paths::SOCKET_FILE);

    let stream = match UnixStream::connect(&socket).await {
        Ok(stream) => {
            debug!(socket = %socket.display(), "daemon already listening");
            stream
        }
        Err(_) => {
            spawn_daemon(spec, &project_root, &dir)?;
            probe(&socket, STARTUP_BUDGET).await?
        }
    };

    info!(server = spec.name, root = %project_root.display(), "connected");
    proxy_stdio(stream).await?;
    Ok(ExitCode::SUCCESS)
}

/// The argument vector for the internal daemon entry point.
fn daemon_args(
    spec: &ServerSpec,
    project_root: &std::path::Path,
    socket: &std::path::Path,
) -> Vec<std::ffi::OsString> {
    vec![
        "daemon".into(),
        "--server".into(),
        spec.name.into(),
        "--projectRoot".into(),
        project_root.into(),
        "--socket".into(),
        socket.into(),
    ]
}

/// Start the daemon detached, with its output appended to the log file.
fn spawn_daemon(
    spec: &'static ServerSpec,
    project_root: &std::path::Path,
    dir: &std::path::Path,
) -> Result<(), CliError> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(paths::LOG_FILE))?;

    let mut command = std::process::Command::new(exe);
    command
        .args(daemon_args(spec, project_root, &dir.join(paths::SOCKET_FILE)))
        .stdin(std::process::Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0);
    let child = command.spawn()?;

    info!(pid = child.id(), server = spec.name, "daemon spawned");
    Ok(())
}

/// Poll the socket until the daemon answers or the budget runs out.
async fn probe(socket: &std::path::Path, budget: Duration) -> Result<UnixStream, CliError> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Ok(stream) = UnixStream::connect(socket).await {
            return Ok(stream);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CliError(format!(
                "daemon did not start listening on {} within {budget:?}",
                socket.display()
            )));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

/// Pump bytes both ways until either side closes.
async fn proxy_stdio(stream: UnixStream) -> Result<(), CliError> {
    let (mut socket_read, mut socket_write) = stream.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    tokio::select! {
        result = tokio::io::copy(&mut stdin, &mut socket_write) => {
            debug!("stdin closed ({:?} bytes)", result.ok());
        }
        result = tokio::io::copy(&mut socket_read, &mut stdout) => {
            debug!("daemon closed ({:?} bytes)", result.ok());
        }
    }
    Ok(())
}
