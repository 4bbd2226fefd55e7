//! Length-prefixed framing for lspmux streams.
//!
//! Both sides of the daemon speak the same wire format: one or more header
//! lines terminated by `\r\n`, a blank line, then a UTF-8 JSON body of
//! exactly the byte length declared by `Content-Length`. The codec is
//! sans-IO so the same decoder drives the server's stdout and every client
//! socket; thin async helpers adapt it to `tokio::io` streams.

pub mod framing;

pub use framing::{encode, read_message, write_message, FrameCodec, FrameError};
