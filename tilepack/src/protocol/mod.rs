//! Worker communication protocol.
//!
//! Controller and worker execute as independent concurrent units — two
//! tasks in one process, or two processes — and communicate exclusively
//! through asynchronous, correlated messages:
//!
//! ```text
//! ┌────────────┐  Envelope {id, kind, payload}   ┌────────────┐
//! │ controller │ ───────────────────────────────►│   worker   │
//! │            │ ◄─────────────────────────────── │            │
//! └────────────┘  Reply {status, request, ...}   └────────────┘
//! ```
//!
//! Replies are matched only by correlation id plus command kind (plus
//! extra discriminators for tile and export sub-flows); the protocol
//! places no ordering requirement between unrelated correlation ids.

pub mod ipc;
mod message;
mod transport;

pub use message::{
    CorrelationId, Envelope, ExportColumn, ExportCommand, MessageKind, Payload, PendingRequests,
    Reply, ReplyData, ReplyStatus, TileAddress, TileCoord, TileRequestKey,
};
pub use transport::{
    channel_pair, ChunkPolicy, ControllerEndpoint, TransportError, WorkerEndpoint,
    DEFAULT_CHUNK_BYTES,
};
