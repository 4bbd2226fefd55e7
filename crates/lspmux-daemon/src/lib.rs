//! lspmux daemon core.
//!
//! The [`mux::Mux`] owns one language-server child process and any number
//! of client connections, translating request identifiers in both
//! directions so concurrent editors can share the child. The diagnostics
//! bridge synthesizes push diagnostics from pull-only servers, the
//! [`listener`] accepts clients on a local socket, and [`paths`] defines
//! the on-disk daemon state the management CLI reads.

mod bridge;
mod client;
pub mod listener;
pub mod mux;
pub mod paths;
pub mod server;

pub use listener::{run_daemon, DaemonError};
pub use mux::{Mux, MuxConfig};
pub use server::{ExitInfo, ServerHandle};
