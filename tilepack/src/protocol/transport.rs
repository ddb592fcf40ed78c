//! Transport bindings between controller and worker.
//!
//! Both bindings expose the same pair of endpoints, so the protocol logic
//! never depends on which one is active:
//!
//! - [`channel_pair`] wires the endpoints directly over in-process channels
//!   (the background-worker binding).
//! - [`super::ipc`] wires the same endpoints over a child process's stdio
//!   with length-delimited frames (the out-of-process binding).
//!
//! Sends never block the caller; completion is observed through a later
//! inbound reply carrying the same correlation id.

use thiserror::Error;
use tokio::sync::mpsc;

use super::message::{Envelope, Reply};

/// Transport failures, distinct from protocol-level error replies.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The other side of the channel is gone.
    #[error("transport channel closed")]
    Closed,

    /// A frame could not be encoded or decoded (IPC binding only).
    #[error("frame error: {0}")]
    Frame(String),

    /// The worker child process could not be spawned or wired up.
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Controller side of a transport binding: sends requests, receives
/// replies.
#[derive(Debug)]
pub struct ControllerEndpoint {
    request_tx: mpsc::UnboundedSender<Envelope>,
    reply_rx: mpsc::UnboundedReceiver<Reply>,
}

impl ControllerEndpoint {
    pub(crate) fn new(
        request_tx: mpsc::UnboundedSender<Envelope>,
        reply_rx: mpsc::UnboundedReceiver<Reply>,
    ) -> Self {
        Self {
            request_tx,
            reply_rx,
        }
    }

    /// Transmits a request without blocking the caller.
    pub fn send(&self, request: Envelope) -> Result<(), TransportError> {
        self.request_tx
            .send(request)
            .map_err(|_| TransportError::Closed)
    }

    /// A sender handle that can be cloned for concurrent producers.
    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.request_tx.clone()
    }

    /// Receives the next inbound reply, or `None` once the worker side is
    /// gone.
    pub async fn recv(&mut self) -> Option<Reply> {
        self.reply_rx.recv().await
    }

    /// Splits the endpoint into its sender and the reply stream, for
    /// callers that pump replies from a dedicated task.
    pub fn split(self) -> (mpsc::UnboundedSender<Envelope>, mpsc::UnboundedReceiver<Reply>) {
        (self.request_tx, self.reply_rx)
    }
}

/// Worker side of a transport binding: receives requests, sends replies.
#[derive(Debug)]
pub struct WorkerEndpoint {
    request_rx: mpsc::UnboundedReceiver<Envelope>,
    reply_tx: mpsc::UnboundedSender<Reply>,
}

impl WorkerEndpoint {
    pub(crate) fn new(
        request_rx: mpsc::UnboundedReceiver<Envelope>,
        reply_tx: mpsc::UnboundedSender<Reply>,
    ) -> Self {
        Self {
            request_rx,
            reply_tx,
        }
    }

    /// Receives the next inbound request, or `None` once the controller
    /// side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.request_rx.recv().await
    }

    /// Sends a reply back to the controller.
    pub fn reply(&self, reply: Reply) -> Result<(), TransportError> {
        self.reply_tx.send(reply).map_err(|_| TransportError::Closed)
    }

    /// A reply sender that can be handed to command handlers.
    pub fn reply_sender(&self) -> mpsc::UnboundedSender<Reply> {
        self.reply_tx.clone()
    }
}

/// How the worker slices export buffers for `get-chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Return the entire buffer in one reply (in-process binding; no frame
    /// size concerns).
    WholeBuffer,
    /// Return bounded slices and advance a cursor (out-of-process binding;
    /// keeps individual messages small).
    Bounded(usize),
}

/// Reference chunk bound for the out-of-process binding: 1 MiB.
pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

impl ChunkPolicy {
    /// The policy matching the in-process binding.
    pub fn in_process() -> Self {
        ChunkPolicy::WholeBuffer
    }

    /// The policy matching the out-of-process binding.
    pub fn cross_process() -> Self {
        ChunkPolicy::Bounded(DEFAULT_CHUNK_BYTES)
    }
}

/// Creates a connected controller/worker endpoint pair over in-process
/// channels.
pub fn channel_pair() -> (ControllerEndpoint, WorkerEndpoint) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    (
        ControllerEndpoint::new(request_tx, reply_rx),
        WorkerEndpoint::new(request_rx, reply_tx),
    )
}
