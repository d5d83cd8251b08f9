//! Outbound half of a connection to a remote execution agent.
//!
//! The registry only ever needs to push frames at an agent and to hang up on
//! it; inbound frames are delivered by whoever owns the socket read loop.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Data(Bytes),
    Close { reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

pub trait AgentTransport: Send + Sync {
    /// Queue a frame for delivery. Fails synchronously when the peer is gone.
    fn send(&self, frame: Bytes) -> TransportResult<()>;
    /// Ask the writer to close the connection. Idempotent.
    fn close(&self, reason: &str);
    fn is_open(&self) -> bool;
}

/// Transport backed by an unbounded channel drained by a socket writer task.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    closed: AtomicBool,
    label: parking_lot::RwLock<Option<String>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
                label: parking_lot::RwLock::new(None),
            },
            rx,
        )
    }

    /// Attach a human-readable label (usually the remote address) for logs.
    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.write() = Some(label.into());
    }

    pub fn label(&self) -> Option<String> {
        self.label.read().clone()
    }
}

impl AgentTransport for ChannelTransport {
    fn send(&self, frame: Bytes) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(OutboundFrame::Data(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(OutboundFrame::Close {
            reason: reason.to_string(),
        });
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}
