//! lspmux protocol types.
//!
//! JSON-RPC 2.0 compatible message model shared by the daemon and the CLI.
//! This crate is the single source of truth for the message envelope, the
//! request-id type, and the JSON-RPC error object. Payloads stay raw
//! (`serde_json::Value`); the multiplexer only ever inspects or rewrites
//! the narrow set of fields it routes on.

pub mod error;
pub mod message;

pub use error::{RpcError, RpcErrorCode};
pub use message::{Message, Notification, Request, RequestId, Response};
