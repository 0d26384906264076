//! Channel abstraction consumed by the transfer sessions.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use blockpull_protocol::{Frame, WireError};
use tokio::sync::mpsc;

/// Send half of a message-oriented, bidirectional channel.
///
/// Inbound messages are delivered separately as a stream of [`Frame`]s.
/// `outstanding_bytes` reports how much accepted data the transport has
/// not yet put on the wire; the chunk streamer throttles on it.
pub trait Channel: Send + Sync {
    /// Queues a frame for sending without blocking.
    fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Returns `true` while the channel accepts frames.
    fn is_open(&self) -> bool;

    /// Bytes queued but not yet written to the transport.
    fn outstanding_bytes(&self) -> usize;
}

/// Errors returned by [`Channel::send`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// One side of an in-process channel pair.
pub struct MemoryEnd {
    pub channel: Arc<MemoryChannel>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Creates two connected in-process channel ends.
pub fn memory_pair() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryEnd {
            channel: Arc::new(MemoryChannel::new(b_tx)),
            inbound: a_rx,
        },
        MemoryEnd {
            channel: Arc::new(MemoryChannel::new(a_tx)),
            inbound: b_rx,
        },
    )
}

/// In-process [`Channel`] delivering frames to the peer's inbound queue.
///
/// Delivery is immediate, so the outstanding byte counter only changes
/// when set explicitly through [`MemoryChannel::set_outstanding`]; this
/// simulates a congested transport.
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    outstanding: AtomicUsize,
    sent_frames: AtomicU64,
    sent_payload: AtomicU64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            outstanding: AtomicUsize::new(0),
            sent_frames: AtomicU64::new(0),
            sent_payload: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Overrides the reported outstanding byte count.
    pub fn set_outstanding(&self, bytes: usize) {
        self.outstanding.store(bytes, Ordering::SeqCst);
    }

    /// Number of frames accepted so far.
    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::SeqCst)
    }

    /// Chunk payload bytes accepted so far.
    pub fn sent_payload_bytes(&self) -> u64 {
        self.sent_payload.load(Ordering::SeqCst)
    }

    /// Closes the channel; the peer's inbound stream ends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
    }
}

impl Channel for MemoryChannel {
    fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let payload = frame.payload_len() as u64;
        let guard = self.tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(frame).map_err(|_| ChannelError::Closed)?;
        self.sent_frames.fetch_add(1, Ordering::SeqCst);
        self.sent_payload.fetch_add(payload, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.tx
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}
