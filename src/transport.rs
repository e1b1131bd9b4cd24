//! Transport adapter seam
//!
//! The core only needs a transport able to carry discrete frames on a live
//! connection and to signal close by ending the stream. Handshakes,
//! heartbeats, reconnection and raw wire encoding stay with the adapter.

use crate::frame::Frame;
use crate::types::{MuxError, MuxResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One endpoint of a bidirectional framed connection
#[async_trait]
pub trait FrameTransport: Send {
    /// Send one frame to the peer
    async fn send(&mut self, frame: Frame) -> MuxResult<()>;

    /// Receive the next frame; `None` means the connection closed
    async fn recv(&mut self) -> Option<Frame>;
}

/// In-process duplex transport built from a pair of unbounded queues
///
/// Dropping one endpoint ends the peer's stream, which is how connection
/// close propagates.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Create two linked in-memory endpoints
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    (
        MemoryTransport { tx: a_tx, rx: b_rx },
        MemoryTransport { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send(&mut self, frame: Frame) -> MuxResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| MuxError::SendFailed("peer endpoint dropped".to_string()))
    }

    async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}
