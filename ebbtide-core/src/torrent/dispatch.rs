//! Unbounded FIFO handoff from tracker discovery to connection workers

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::peer::Peer;

/// Unbounded dispatch queue feeding discovered peers to the worker pool.
///
/// Producers (tracker tasks) never block: the queue grows as needed. Each
/// queued peer is delivered to exactly one worker, in push order. After
/// `close`, whatever is buffered stays deliverable until drained, then
/// `next` reports the end of the queue.
pub struct PeerDispatch {
    sender: Mutex<Option<UnboundedSender<Arc<Peer>>>>,
    receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<Arc<Peer>>>>,
}

impl PeerDispatch {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    /// Queues a peer without blocking.
    ///
    /// Returns false once the queue has been closed.
    pub fn push(&self, peer: Arc<Peer>) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(peer).is_ok(),
            None => false,
        }
    }

    /// Waits for the next peer in FIFO order.
    ///
    /// Workers share one receiver, so each peer is handed to exactly one
    /// caller. Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<Arc<Peer>> {
        self.receiver.lock().await.recv().await
    }

    /// Closes the queue for producers. Buffered peers remain deliverable.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

impl Default for PeerDispatch {
    fn default() -> Self {
        Self::new()
    }
}
