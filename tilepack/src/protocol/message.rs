//! Message envelope and reply types.
//!
//! Every operation against a package crosses the bus as an [`Envelope`]
//! carrying a caller-assigned correlation id, a command kind, and a
//! kind-specific payload. The worker answers with a [`Reply`] that wraps
//! the original request, so a controller can match responses to the
//! requests it has outstanding and ignore everything else.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::catalog::TableDescriptor;
use crate::package::FeatureRecord;

/// Caller-assigned opaque identifier scoping request/response pairs and,
/// for long-lived sessions, all operations against one open package.
pub type CorrelationId = String;

/// Operation selector for an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Worker bootstrap; no reply is sent.
    OpenLibrary,
    /// Open a package session from raw bytes or a path.
    Open,
    /// Close a session. Idempotent; no reply is sent.
    Close,
    /// List the package's table descriptors.
    ListTables,
    /// Retrieve one rendered tile.
    GetTile,
    /// Stream a feature table's rows.
    GetFeatures,
    /// Export sub-command; the payload's `command` field selects which.
    Export,
}

/// Sub-commands of the export pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportCommand {
    /// Open a fresh package for the job.
    Create,
    /// Create one destination feature table.
    CreateTable,
    /// Insert one table's buffered features.
    FeatureBatch,
    /// Worker → controller only: periodic insert count for one table.
    Progress,
    /// Serialize the package to the job's output buffer.
    Write,
    /// Fetch the next slice of the output buffer.
    GetChunk,
    /// Tear the job down after the buffer has been retrieved.
    WriteFinish,
}

/// Display tile coordinate, an alternative to extent addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    /// Display zoom level.
    pub z: u8,
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

/// One column definition supplied with an export `create-table` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportColumn {
    /// Source field name.
    pub field: String,
    /// Source type label (`decimal`, `integer`, `datetime`, anything else
    /// maps to text).
    pub column_type: String,
}

/// Kind-specific request fields. Handlers validate the fields their kind
/// requires and reply with a protocol error when one is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Raw package bytes (open).
    pub data: Option<Bytes>,
    /// File path (open, export create) or scratch directory (open-library).
    pub path: Option<PathBuf>,
    /// Target table.
    pub table_name: Option<String>,
    /// Requested zoom level.
    pub zoom: Option<u8>,
    /// Requested extent `[west, south, east, north]` in EPSG:4326.
    pub extent: Option<[f64; 4]>,
    /// Display tile coordinate, when the caller addresses tiles that way.
    pub tile_coord: Option<TileCoord>,
    /// Display projection for the rendered tile.
    pub projection: Option<String>,
    /// Output width in pixels.
    pub width: Option<u32>,
    /// Output height in pixels.
    pub height: Option<u32>,
    /// Column list (export create-table).
    pub columns: Option<Vec<ExportColumn>>,
    /// Feature batch (export feature-batch).
    pub features: Option<Vec<FeatureRecord>>,
    /// Export sub-command selector.
    pub command: Option<ExportCommand>,
    /// Progress count (worker → controller).
    pub count: Option<u64>,
}

/// The unit of communication between controller and worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id.
    pub id: CorrelationId,
    /// Operation selector.
    pub kind: MessageKind,
    /// Kind-specific fields.
    pub payload: Payload,
}

impl Envelope {
    /// Creates an envelope with an empty payload.
    pub fn new(id: impl Into<CorrelationId>, kind: MessageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: Payload::default(),
        }
    }

    /// Creates an envelope with the given payload.
    pub fn with_payload(id: impl Into<CorrelationId>, kind: MessageKind, payload: Payload) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
        }
    }

    /// Copy of this envelope with the large payload fields removed.
    ///
    /// Error replies echo the request that produced them, but must never
    /// carry back raw package bytes or feature batches.
    pub fn stripped(&self) -> Envelope {
        let mut copy = self.clone();
        copy.payload.data = None;
        copy.payload.features = None;
        copy
    }
}

/// Success or error discriminator for a [`Reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// The command completed.
    Success,
    /// The command failed; `reason` carries the failure.
    Error,
}

/// Success payload of a [`Reply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyData {
    /// Descriptors from `list-tables`.
    Tables(Vec<TableDescriptor>),
    /// An encoded tile image.
    Tile(Bytes),
    /// The package has no data at the requested location. Renders as a
    /// blank tile, never as a fallback to a parent tile.
    EmptyTile,
    /// One streamed feature.
    Feature(FeatureRecord),
    /// Sentinel ending a feature stream.
    FeaturesDone,
    /// Running insert count for one export table.
    Progress(u64),
    /// One slice of an export buffer; empty means end-of-data.
    Chunk(Bytes),
}

/// A response referencing exactly the request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Success or error.
    pub status: ReplyStatus,
    /// The original request (stripped of large payloads on error).
    pub request: Envelope,
    /// Success payload, when the command produces one.
    pub result: Option<ReplyData>,
    /// Failure reason on error.
    pub reason: Option<String>,
}

impl Reply {
    /// Builds a success reply wrapping the original request.
    pub fn success(request: Envelope, result: Option<ReplyData>) -> Self {
        Self {
            status: ReplyStatus::Success,
            request,
            result,
            reason: None,
        }
    }

    /// Builds an error reply. The echoed request keeps its identifying
    /// fields but drops any large payload it carried.
    pub fn error(request: &Envelope, reason: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            request: request.stripped(),
            result: None,
            reason: Some(reason.into()),
        }
    }

    /// True when this reply answers a request with the given id and kind.
    pub fn answers(&self, id: &str, kind: MessageKind) -> bool {
        self.request.id == id && self.request.kind == kind
    }

    /// True when this reply reports success.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

/// Addressing discriminator of a [`TileRequestKey`]: whichever scheme the
/// caller used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TileAddress {
    /// Display tile coordinate.
    Coord(TileCoord),
    /// Requested extent, rendered to a stable string form.
    Extent(String),
}

/// Identifies one in-flight tile fetch so its response can be matched to
/// the right pending slot. Entries are removed once answered; a response
/// whose key is no longer tracked is silently discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileRequestKey {
    /// Correlation id.
    pub id: CorrelationId,
    /// Command kind (always `GetTile` for tile fetches).
    pub kind: MessageKind,
    /// Target table.
    pub table_name: String,
    /// Coordinate or extent, whichever the request carried.
    pub address: TileAddress,
}

impl TileRequestKey {
    /// Derives the key from a request envelope. Returns `None` when the
    /// payload carries neither a table name nor an address.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let table_name = envelope.payload.table_name.clone()?;

        let address = if let Some(coord) = envelope.payload.tile_coord {
            TileAddress::Coord(coord)
        } else {
            let extent = envelope.payload.extent?;
            TileAddress::Extent(format_extent(&extent))
        };

        Some(Self {
            id: envelope.id.clone(),
            kind: envelope.kind,
            table_name,
            address,
        })
    }
}

/// Stable string form of an extent used for request keying. The reply
/// echoes the request's extent verbatim, so both sides derive the same
/// string.
fn format_extent(extent: &[f64; 4]) -> String {
    format!("{},{},{},{}", extent[0], extent[1], extent[2], extent[3])
}

/// Registry of pending request keys on the controller side.
///
/// Tracks which tile fetches are still awaiting an answer. A reply for a
/// key that is no longer (or never was) tracked is dropped.
#[derive(Debug, Default)]
pub struct PendingRequests<T> {
    entries: HashMap<TileRequestKey, T>,
}

impl<T> PendingRequests<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Tracks a request under its key, returning any entry it displaced.
    pub fn insert(&mut self, key: TileRequestKey, value: T) -> Option<T> {
        self.entries.insert(key, value)
    }

    /// Removes and returns the entry for an answered request.
    pub fn take(&mut self, key: &TileRequestKey) -> Option<T> {
        self.entries.remove(key)
    }

    /// Drops a request without answering it (cancellation).
    pub fn forget(&mut self, key: &TileRequestKey) {
        self.entries.remove(key);
    }

    /// Number of requests still awaiting an answer.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
