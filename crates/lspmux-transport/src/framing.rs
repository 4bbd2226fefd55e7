//! Content-Length framing codec and async stream helpers.

use std::fmt;

use lspmux_protocol::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Separates the header block from the body.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Chunk size for stream reads feeding the codec.
const READ_CHUNK: usize = 8 * 1024;

/// Error produced while encoding or decoding a framed stream.
#[derive(Debug)]
pub enum FrameError {
    /// A complete header block arrived without a well-formed `Content-Length`.
    MissingContentLength,
    /// The `Content-Length` value is not a non-negative integer.
    InvalidContentLength(String),
    /// The stream ended in the middle of a frame.
    UnexpectedEof,
    /// The body was not a valid JSON-RPC message.
    InvalidBody(serde_json::Error),
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingContentLength => write!(f, "header block has no Content-Length"),
            Self::InvalidContentLength(v) => write!(f, "invalid Content-Length: {v:?}"),
            Self::UnexpectedEof => write!(f, "stream ended mid-frame"),
            Self::InvalidBody(e) => write!(f, "invalid message body: {e}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidBody(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Incremental decoder for Content-Length framed messages.
///
/// Bytes arrive in arbitrary chunks via [`FrameCodec::feed`]; complete
/// messages are drained out via [`FrameCodec::decode`]. Consumed frames are
/// drained from the front of the buffer so long runs of messages do not
/// grow it without bound.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode one message. `Ok(None)` means more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Message>, FrameError> {
        let Some(header_end) = find(&self.buf, HEADER_TERMINATOR) else {
            return Ok(None);
        };
        let length = parse_content_length(&self.buf[..header_end])?;
        let body_start = header_end + HEADER_TERMINATOR.len();
        if self.buf.len() < body_start + length {
            return Ok(None);
        }
        let body = &self.buf[body_start..body_start + length];
        let message = serde_json::from_slice(body).map_err(FrameError::InvalidBody)?;
        self.buf.drain(..body_start + length);
        Ok(Some(message))
    }

    /// True when a partial frame is buffered; EOF now is a framing error.
    pub fn is_mid_frame(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Bytes currently buffered (used by tests to observe compaction).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Encode a message as `Content-Length: N\r\n\r\n<body>`.
///
/// The declared length is the UTF-8 byte length of the serialized body,
/// not its character count.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message).map_err(FrameError::InvalidBody)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read one framed message, buffering partial frames in `codec`.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary; EOF with a partial
/// frame buffered is [`FrameError::UnexpectedEof`].
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &mut FrameCodec,
) -> Result<Option<Message>, FrameError> {
    loop {
        if let Some(message) = codec.decode()? {
            return Ok(Some(message));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return if codec.is_mid_frame() {
                Err(FrameError::UnexpectedEof)
            } else {
                Ok(None)
            };
        }
        codec.feed(&chunk[..n]);
    }
}

/// Encode and write one framed message, flushing the stream.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), FrameError> {
    let bytes = encode(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse the `Content-Length` header out of a complete header block.
/// Other headers are ignored.
fn parse_content_length(header: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| FrameError::InvalidContentLength("<non-utf8 header>".into()))?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FrameError::MissingContentLength)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
