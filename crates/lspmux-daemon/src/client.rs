//! Per-client connection plumbing.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One connected editor client, as seen by the mux.
///
/// The handle holds the buffered writer's sending side; the socket halves
/// live in the writer and reader tasks. Client ids are monotonically
/// increasing and never reused within the life of the mux.
pub(crate) struct ClientHandle {
    pub id: u64,
    /// Framed bytes to this client. A full channel is the congestion
    /// signal: senders suspend until the writer drains.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Whether this client advertised `textDocument.diagnostic` support
    /// in its `initialize` params.
    pub pull_diagnostics: bool,
    pub(crate) reader: Option<JoinHandle<()>>,
}

impl ClientHandle {
    pub(crate) fn close(self) {
        debug!(client = self.id, "closing client connection");
        if let Some(reader) = self.reader {
            reader.abort();
        }
        // Dropping `tx` lets the writer task run out and shut the socket.
    }
}

/// Drain a buffered writer channel onto a byte sink.
///
/// Used for both client sockets and the server's stdin: exactly one writer
/// task per destination, serialized FIFO. The task ends when every sender
/// is dropped or the sink fails.
pub(crate) fn spawn_writer<W>(mut sink: W, mut rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.write_all(&frame).await {
                debug!(error = %e, "writer closed");
                break;
            }
            if let Err(e) = sink.flush().await {
                debug!(error = %e, "writer flush failed");
                break;
            }
        }
        let _ = sink.shutdown().await;
    })
}
