//! Keyed tile fetches over the message bus.
//!
//! Concurrent tile requests for different coordinates must not collide, so
//! every in-flight fetch is tracked under its [`TileRequestKey`] — the
//! correlation id, command kind, table, and the coordinate or extent the
//! caller addressed the tile by. A reply whose key is no longer tracked
//! (the fetch was abandoned) is silently discarded.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{ClientError, MessageBus};
use crate::protocol::{
    CorrelationId, Envelope, MessageKind, Payload, PendingRequests, ReplyData, TileCoord,
    TileRequestKey,
};

/// Outcome of one tile fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum TileResult {
    /// An encoded tile image.
    Image(Bytes),
    /// The package has no data at the requested location; render a blank
    /// tile, not a parent fallback.
    Empty,
}

/// Parameters of one tile fetch.
#[derive(Debug, Clone)]
pub struct TileFetch {
    /// Target tile table.
    pub table: String,
    /// Display zoom level.
    pub zoom: u8,
    /// Requested extent `[west, south, east, north]` in EPSG:4326.
    pub extent: [f64; 4],
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Display projection; the worker assumes EPSG:4326 when absent.
    pub projection: Option<String>,
    /// Display tile coordinate, when the caller addresses tiles that way.
    pub coord: Option<TileCoord>,
}

type PendingSender = oneshot::Sender<Result<TileResult, String>>;

/// Issues tile requests for one session and routes replies back to their
/// pending fetches by request key.
pub struct TileFetcher {
    bus: Arc<MessageBus>,
    id: CorrelationId,
    pending: Arc<Mutex<PendingRequests<PendingSender>>>,
    router: JoinHandle<()>,
}

impl TileFetcher {
    /// Creates a fetcher for the given session id, registering its reply
    /// router on the bus.
    pub fn new(bus: Arc<MessageBus>, id: impl Into<CorrelationId>) -> Self {
        let pending = Arc::new(Mutex::new(PendingRequests::<PendingSender>::new()));

        let mut listener = bus.listen();
        let router_pending = Arc::clone(&pending);
        let router = tokio::spawn(async move {
            while let Some(reply) = listener.recv().await {
                if reply.request.kind != MessageKind::GetTile {
                    continue;
                }

                let Some(key) = TileRequestKey::from_envelope(&reply.request) else {
                    continue;
                };

                // A key nobody tracks belongs to an abandoned or foreign
                // fetch; drop the reply.
                let Some(tx) = router_pending.lock().take(&key) else {
                    trace!(table = %key.table_name, "Dropping reply for untracked tile request");
                    continue;
                };

                let outcome = if reply.is_success() {
                    match &reply.result {
                        Some(ReplyData::Tile(image)) => Ok(TileResult::Image(image.clone())),
                        Some(ReplyData::EmptyTile) => Ok(TileResult::Empty),
                        _ => Err("unexpected tile reply payload".to_string()),
                    }
                } else {
                    Err(reply.reason.clone().unwrap_or_default())
                };

                // The fetch future may be gone; that is a cancelled fetch.
                let _ = tx.send(outcome);
            }
        });

        Self {
            bus,
            id: id.into(),
            pending,
            router,
        }
    }

    /// Fetches one tile. Concurrent fetches for different coordinates are
    /// independent; abandoning the returned future abandons the fetch, and
    /// its late reply is discarded.
    pub async fn fetch(&self, fetch: TileFetch) -> Result<TileResult, ClientError> {
        let envelope = Envelope::with_payload(
            self.id.as_str(),
            MessageKind::GetTile,
            Payload {
                table_name: Some(fetch.table),
                zoom: Some(fetch.zoom),
                extent: Some(fetch.extent),
                tile_coord: fetch.coord,
                projection: fetch.projection,
                width: Some(fetch.width),
                height: Some(fetch.height),
                ..Default::default()
            },
        );

        let key = TileRequestKey::from_envelope(&envelope)
            .expect("tile envelope always carries table and address");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);

        if let Err(e) = self.bus.send(envelope) {
            self.pending.lock().forget(&key);
            return Err(e.into());
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(reason)) => Err(ClientError::Worker(reason)),
            Err(_) => Err(ClientError::ChannelClosed),
        }
    }

    /// Number of fetches still awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for TileFetcher {
    fn drop(&mut self) {
        self.router.abort();
    }
}
