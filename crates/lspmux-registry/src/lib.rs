//! Server behavior registry.
//!
//! Each supported language server is described by an immutable
//! [`ServerSpec`]: how to find and invoke the binary, which diagnostics
//! mode the multiplexer runs it in, and the optional hook applied to the
//! first `initialize` before it is forwarded. Specs are looked up by
//! canonical name or alias.

pub mod builtin;

use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Transform applied to the first `initialize` params before forwarding.
pub type PrepareInitialize = fn(Value) -> Value;

/// Builds the params of a pull-diagnostics request for a document URI.
pub type BuildPullRequest = fn(&str) -> Value;

/// How diagnostics flow between the server and clients.
#[derive(Debug, Clone, Copy)]
pub enum DiagnosticsMode {
    /// The server pushes `textDocument/publishDiagnostics` itself; the mux
    /// just broadcasts them.
    Passthrough,
    /// The server only answers `textDocument/diagnostic` pulls; the mux
    /// queries it on file events and republishes for clients that cannot.
    PullBridge {
        /// Coalescing window for file events, in milliseconds.
        debounce_ms: u64,
        /// Overrides the default pull-request params when set.
        build_request: Option<BuildPullRequest>,
    },
}

/// Suggested installation for a server binary that cannot be found.
#[derive(Debug, Clone, Copy)]
pub struct InstallHint {
    pub package: &'static str,
    pub command: &'static str,
}

/// How to locate a server executable.
#[derive(Debug, Clone, Copy)]
pub struct BinarySpec {
    /// Environment variable that overrides resolution entirely.
    pub env_var: &'static str,
    /// Executable names probed on `PATH`, in order.
    pub candidates: &'static [&'static str],
    /// Directory probed under the project root (e.g. `node_modules/.bin`).
    pub local_probe: Option<&'static str>,
    /// Recorded for error text; the daemon never runs installers.
    pub install: Option<InstallHint>,
}

/// Immutable behavior descriptor for one language server.
#[derive(Debug, Clone, Copy)]
pub struct ServerSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub binary: BinarySpec,
    /// Arguments appended when invoking the server in stdio LSP mode.
    pub args: &'static [&'static str],
    pub diagnostics: DiagnosticsMode,
    pub prepare_initialize: Option<PrepareInitialize>,
}

impl ServerSpec {
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }
}

/// Requested spec name is not registered.
#[derive(Debug)]
pub struct UnknownServer(pub String);

impl fmt::Display for UnknownServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown server {:?} (known: {})",
            self.0,
            all()
                .iter()
                .map(|s| s.name)
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl std::error::Error for UnknownServer {}

/// Look up a spec by canonical name or alias.
pub fn lookup(name: &str) -> Result<&'static ServerSpec, UnknownServer> {
    builtin::SPECS
        .iter()
        .find(|spec| spec.matches(name))
        .ok_or_else(|| UnknownServer(name.to_string()))
}

/// All distinct registered specs, for help output.
pub fn all() -> &'static [ServerSpec] {
    builtin::SPECS
}

/// Failure to locate a server executable.
#[derive(Debug)]
pub struct ResolveError {
    pub spec: &'static str,
    pub install: Option<InstallHint>,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no executable found for server {:?}", self.spec)?;
        if let Some(hint) = &self.install {
            write!(f, " (install {} with `{}`)", hint.package, hint.command)?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolveError {}

/// Locate the executable for a spec.
///
/// Resolution order: the spec's env-var override, each candidate name
/// against each `PATH` entry, then the spec's local probe directory under
/// the project root.
pub fn resolve_binary(spec: &ServerSpec, project_root: &Path) -> Result<PathBuf, ResolveError> {
    if let Ok(path) = std::env::var(spec.binary.env_var) {
        if !path.is_empty() {
            tracing::debug!(server = spec.name, path = %path, "binary resolved from env override");
            return Ok(PathBuf::from(path));
        }
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for candidate in spec.binary.candidates {
                let full = dir.join(candidate);
                if is_executable(&full) {
                    return Ok(full);
                }
            }
        }
    }

    if let Some(probe) = spec.binary.local_probe {
        for candidate in spec.binary.candidates {
            let full = project_root.join(probe).join(candidate);
            if is_executable(&full) {
                tracing::debug!(server = spec.name, path = %full.display(), "binary resolved from project probe");
                return Ok(full);
            }
        }
    }

    Err(ResolveError {
        spec: spec.name,
        install: spec.binary.install,
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
