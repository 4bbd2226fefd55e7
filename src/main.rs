//! lspmux — share one language server between many editors.
//!
//! `connect` proxies an editor's stdio onto the per-(server, project)
//! daemon socket, starting the daemon if it is not running. `ps`, `kill`,
//! and `prune` manage daemons through their state directories. `daemon`
//! is the internal entry point `connect` spawns.
//!
//! Usage:
//!   lspmux connect tsgo --project /path/to/project
//!   lspmux ps --json
//!   lspmux kill tsgo --project /path/to/project
//!   lspmux kill --all
//!   lspmux prune

mod admin;
mod proxy;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Environment variable controlling log verbosity.
const LOG_ENV: &str = "LSPMUX_LOG";

#[derive(Parser, Debug)]
#[command(name = "lspmux", about = "Share one language server between many editors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Proxy stdio to the daemon for a server, starting it if needed.
    Connect {
        /// Server name or alias.
        server: String,
        /// Project root; defaults to the current directory.
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// List known daemons and their status.
    Ps {
        #[arg(long)]
        json: bool,
    },
    /// Terminate a daemon (or all of them).
    Kill {
        /// Server name or alias.
        server: Option<String>,
        /// Project root; defaults to the current directory.
        #[arg(long)]
        project: Option<PathBuf>,
        /// Terminate every known daemon.
        #[arg(long)]
        all: bool,
    },
    /// Remove state directories of dead daemons.
    Prune,
    /// Internal entry point spawned by `connect`.
    #[command(hide = true)]
    Daemon {
        #[arg(long)]
        server: String,
        #[arg(long = "projectRoot")]
        project_root: PathBuf,
        #[arg(long)]
        socket: PathBuf,
    },
}

/// Operational failure; usage errors exit 2 via clap before we get here.
#[derive(Debug)]
pub(crate) struct CliError(pub String);

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<lspmux_registry::UnknownServer> for CliError {
    fn from(e: lspmux_registry::UnknownServer) -> Self {
        Self(e.to_string())
    }
}

impl From<lspmux_daemon::DaemonError> for CliError {
    fn from(e: lspmux_daemon::DaemonError) -> Self {
        Self(e.to_string())
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr; stdout may be carrying the protocol.
fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(CliError(message)) => {
            eprintln!("lspmux: {message}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    match cli.command {
        Command::Connect { server, project } => {
            init_stderr_logging();
            proxy::connect(&server, project).await
        }
        Command::Ps { json } => {
            init_stderr_logging();
            admin::ps(json).await
        }
        Command::Kill {
            server,
            project,
            all,
        } => {
            init_stderr_logging();
            admin::kill(server.as_deref(), project, all).await
        }
        Command::Prune => {
            init_stderr_logging();
            admin::prune().await
        }
        Command::Daemon {
            server,
            project_root,
            socket,
        } => daemon(&server, project_root, socket).await,
    }
}

/// The internal daemon entry point. Logs go to the state directory so the
/// child's inherited streams stay clean.
async fn daemon(
    server: &str,
    project_root: PathBuf,
    socket: PathBuf,
) -> Result<ExitCode, CliError> {
    let spec = lspmux_registry::lookup(server)?;

    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(lspmux_daemon::paths::LOG_FILE))?;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::sync::Arc::new(log))
            .with_ansi(false)
            .init();
    }

    let exit = lspmux_daemon::run_daemon(spec, project_root, socket).await?;
    tracing::info!(%exit, "daemon exiting");
    Ok(ExitCode::SUCCESS)
}
