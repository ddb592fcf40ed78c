//! Controller-side protocol surface.
//!
//! [`MessageBus`] owns the controller endpoint and fans every inbound
//! reply out to registered listeners; each consumer filters for the
//! correlation ids it has outstanding and ignores everything else. On top
//! of the bus sit [`PackageClient`] (sessions, catalog, feature
//! streaming), [`tiles::TileFetcher`] (keyed in-flight tile fetches), and
//! [`export::Exporter`] (the multi-phase export state machine).

pub mod export;
pub mod tiles;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::catalog::{fix_resolutions, TableDescriptor};
use crate::package::FeatureRecord;
use crate::protocol::{
    ControllerEndpoint, CorrelationId, Envelope, MessageKind, Payload, Reply, ReplyData,
    TransportError,
};

/// Property key stripped from streamed features: an embedded binary
/// geometry property would corrupt the reconstructed feature.
const GEOMETRY_PROPERTY: &str = "geometry";

/// Controller-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport refused the send.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The worker answered with an error reply.
    #[error("worker error: {0}")]
    Worker(String),

    /// The worker went away before a reply arrived.
    #[error("worker channel closed before a reply arrived")]
    ChannelClosed,

    /// A success reply carried an unexpected payload shape.
    #[error("unexpected reply payload")]
    UnexpectedReply,

    /// The caller's input could not be serialized for the wire.
    #[error("invalid export input: {0}")]
    Input(String),
}

/// The controller's view of the message bus.
///
/// Sending never blocks; inbound replies are pumped from the endpoint to
/// every registered [`Listener`]. A reply nobody is listening for
/// produces no observable state change.
pub struct MessageBus {
    request_tx: mpsc::UnboundedSender<Envelope>,
    listeners: Arc<DashMap<u64, mpsc::UnboundedSender<Arc<Reply>>>>,
    next_listener: AtomicU64,
}

impl MessageBus {
    /// Wraps a controller endpoint, spawning the reply pump on the current
    /// runtime.
    pub fn new(endpoint: ControllerEndpoint) -> Arc<Self> {
        let (request_tx, mut reply_rx) = endpoint.split();
        let listeners: Arc<DashMap<u64, mpsc::UnboundedSender<Arc<Reply>>>> =
            Arc::new(DashMap::new());

        let pump_listeners = Arc::clone(&listeners);
        tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                let reply = Arc::new(reply);
                pump_listeners.retain(|_, tx| tx.send(Arc::clone(&reply)).is_ok());
            }
            debug!("Reply pump stopped; worker side gone");
        });

        Arc::new(Self {
            request_tx,
            listeners,
            next_listener: AtomicU64::new(1),
        })
    }

    /// Transmits a request without blocking.
    pub fn send(&self, request: Envelope) -> Result<(), TransportError> {
        self.request_tx
            .send(request)
            .map_err(|_| TransportError::Closed)
    }

    /// Registers a listener that receives every inbound reply until it is
    /// dropped.
    pub fn listen(self: &Arc<Self>) -> Listener {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(id, tx);

        Listener {
            id,
            rx,
            bus: Arc::clone(self),
        }
    }

    fn remove_listener(&self, id: u64) {
        self.listeners.remove(&id);
    }
}

/// A registration on the bus. Dropping it removes the registration.
pub struct Listener {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<Reply>>,
    bus: Arc<MessageBus>,
}

impl Listener {
    /// Receives the next reply, or `None` once the worker side is gone.
    pub async fn recv(&mut self) -> Option<Arc<Reply>> {
        self.rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.bus.remove_listener(self.id);
    }
}

/// One package session as seen from the controller, scoped by its
/// correlation id.
pub struct PackageClient {
    bus: Arc<MessageBus>,
    id: CorrelationId,
}

impl PackageClient {
    /// Creates a client for the given session id.
    pub fn new(bus: Arc<MessageBus>, id: impl Into<CorrelationId>) -> Self {
        Self {
            bus,
            id: id.into(),
        }
    }

    /// The session's correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying bus, for composing tile fetchers and exporters over
    /// the same transport.
    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Opens a session from raw package bytes.
    pub async fn open_bytes(&self, data: Bytes) -> Result<(), ClientError> {
        self.open(Payload {
            data: Some(data),
            ..Default::default()
        })
        .await
    }

    /// Opens a session from a package file path.
    pub async fn open_path(&self, path: impl Into<std::path::PathBuf>) -> Result<(), ClientError> {
        self.open(Payload {
            path: Some(path.into()),
            ..Default::default()
        })
        .await
    }

    async fn open(&self, payload: Payload) -> Result<(), ClientError> {
        let mut listener = self.bus.listen();

        // Close any previously-opened handle for this id before opening.
        self.close()?;
        self.bus
            .send(Envelope::with_payload(self.id.as_str(), MessageKind::Open, payload))?;

        loop {
            let reply = listener.recv().await.ok_or(ClientError::ChannelClosed)?;
            if !reply.answers(&self.id, MessageKind::Open) {
                continue;
            }

            if reply.is_success() {
                return Ok(());
            }
            return Err(ClientError::Worker(
                reply.reason.clone().unwrap_or_default(),
            ));
        }
    }

    /// Closes the session. Fire-and-forget and idempotent: no reply is
    /// expected, and closing an unopened session is a no-op.
    pub fn close(&self) -> Result<(), ClientError> {
        self.bus
            .send(Envelope::new(self.id.as_str(), MessageKind::Close))?;
        Ok(())
    }

    /// Lists the package's tables. Tile descriptors come back with their
    /// resolution arrays fully repaired.
    pub async fn list_tables(&self) -> Result<Vec<TableDescriptor>, ClientError> {
        let mut listener = self.bus.listen();
        self.bus
            .send(Envelope::new(self.id.as_str(), MessageKind::ListTables))?;

        loop {
            let reply = listener.recv().await.ok_or(ClientError::ChannelClosed)?;
            if !reply.answers(&self.id, MessageKind::ListTables) {
                continue;
            }

            if !reply.is_success() {
                return Err(ClientError::Worker(
                    reply.reason.clone().unwrap_or_default(),
                ));
            }

            let Some(ReplyData::Tables(tables)) = &reply.result else {
                return Err(ClientError::UnexpectedReply);
            };

            let mut tables = tables.clone();
            for table in &mut tables {
                if let TableDescriptor::Tile(tile) = table {
                    // A consumer must never see gaps in the pyramid.
                    fix_resolutions(&mut tile.resolutions);
                }
            }
            return Ok(tables);
        }
    }

    /// Collects a feature table's rows, streamed one reply per feature and
    /// terminated by the sentinel reply.
    pub async fn features(&self, table: &str) -> Result<Vec<FeatureRecord>, ClientError> {
        let mut listener = self.bus.listen();
        self.bus.send(Envelope::with_payload(
            self.id.as_str(),
            MessageKind::GetFeatures,
            Payload {
                table_name: Some(table.to_string()),
                ..Default::default()
            },
        ))?;

        let mut features = Vec::new();
        loop {
            let reply = listener.recv().await.ok_or(ClientError::ChannelClosed)?;
            if !reply.answers(&self.id, MessageKind::GetFeatures)
                || reply.request.payload.table_name.as_deref() != Some(table)
            {
                continue;
            }

            if !reply.is_success() {
                return Err(ClientError::Worker(
                    reply.reason.clone().unwrap_or_default(),
                ));
            }

            match &reply.result {
                Some(ReplyData::Feature(record)) => {
                    let mut record = record.clone();
                    if record.properties.remove(GEOMETRY_PROPERTY).is_some() {
                        trace!(table = %table, "Stripped embedded geometry property");
                    }
                    features.push(record);
                }
                Some(ReplyData::FeaturesDone) => return Ok(features),
                _ => return Err(ClientError::UnexpectedReply),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{
        ColumnValue, Geometry, MemoryLibrary, MemoryPackage,
    };
    use crate::catalog::ColumnType;
    use crate::package::FeatureColumn;
    use crate::protocol::ReplyStatus;
    use crate::worker::spawn_in_process;
    use std::time::Duration;

    fn sample_package_bytes() -> Bytes {
        MemoryPackage::builder()
            .tile_table("imagery", [-180.0, -90.0, 180.0, 90.0], None, None)
            .tile_level(
                "imagery",
                2,
                256,
                256,
                MemoryPackage::solid_png(64, 32, [0, 120, 80, 255]),
            )
            .tile_level(
                "imagery",
                4,
                256,
                256,
                MemoryPackage::solid_png(128, 64, [0, 120, 80, 255]),
            )
            .feature_table(
                "tracks",
                vec![
                    FeatureColumn {
                        name: "name".to_string(),
                        display_name: None,
                        column_type: ColumnType::Text,
                    },
                    FeatureColumn {
                        name: "seen".to_string(),
                        display_name: None,
                        column_type: ColumnType::DateTime,
                    },
                ],
                true,
                None,
            )
            .feature(
                "tracks",
                FeatureRecord::with_geometry(Geometry::Point([5.0, 6.0]))
                    .property("name", ColumnValue::Text("alpha".to_string()))
                    .property(GEOMETRY_PROPERTY, ColumnValue::Blob(vec![1, 2, 3])),
            )
            .build_bytes()
    }

    async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), fut)
            .await
            .expect("operation completes within timeout")
    }

    #[tokio::test]
    async fn test_open_and_list_tables() {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        let bus = MessageBus::new(endpoint);
        let client = PackageClient::new(bus, "pkg-1");

        with_timeout(client.open_bytes(sample_package_bytes()))
            .await
            .unwrap();

        let tables = with_timeout(client.list_tables()).await.unwrap();
        assert_eq!(tables.len(), 2);

        let TableDescriptor::Tile(tile) = &tables[0] else {
            panic!("first descriptor is the tile table");
        };
        assert_eq!(tile.table_name, "imagery");
        assert!(
            tile.resolutions.iter().all(|r| r.is_some()),
            "resolutions fully repaired"
        );

        let TableDescriptor::Feature(feature) = &tables[1] else {
            panic!("second descriptor is the feature table");
        };
        assert_eq!(feature.table_name, "tracks");
        assert_eq!(feature.columns.len(), 2);
        assert_eq!(feature.columns[1].column_type, ColumnType::DateTime);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_open_bad_bytes_reports_worker_error() {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        let bus = MessageBus::new(endpoint);
        let client = PackageClient::new(bus, "pkg-1");

        let err = with_timeout(client.open_bytes(Bytes::from_static(b"garbage")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Worker(_)));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_features_streamed_and_geometry_property_stripped() {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        let bus = MessageBus::new(endpoint);
        let client = PackageClient::new(bus, "pkg-1");

        with_timeout(client.open_bytes(sample_package_bytes()))
            .await
            .unwrap();

        let features = with_timeout(client.features("tracks")).await.unwrap();
        assert_eq!(features.len(), 1);
        assert!(features[0].properties.contains_key("name"));
        assert!(
            !features[0].properties.contains_key(GEOMETRY_PROPERTY),
            "embedded geometry property stripped"
        );
        assert!(features[0].geometry.is_some(), "real geometry kept");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_close_twice_is_silent() {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        let bus = MessageBus::new(endpoint);
        let client = PackageClient::new(Arc::clone(&bus), "pkg-1");

        with_timeout(client.open_bytes(sample_package_bytes()))
            .await
            .unwrap();

        client.close().unwrap();
        client.close().unwrap();

        // The worker is still healthy afterwards: a list against the
        // closed id errors but is answered.
        let err = with_timeout(client.list_tables()).await.unwrap_err();
        assert!(matches!(err, ClientError::Worker(_)));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unrelated_replies_are_ignored() {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        let bus = MessageBus::new(endpoint);

        let first = PackageClient::new(Arc::clone(&bus), "pkg-1");
        let second = PackageClient::new(Arc::clone(&bus), "pkg-2");

        with_timeout(first.open_bytes(sample_package_bytes()))
            .await
            .unwrap();

        // pkg-2's open fails while pkg-1 keeps working: replies for one id
        // never bleed into the other's operations.
        let err = with_timeout(second.open_bytes(Bytes::from_static(b"junk")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Worker(_)));

        let tables = with_timeout(first.list_tables()).await.unwrap();
        assert_eq!(tables.len(), 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_listener_removed_on_drop() {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        let bus = MessageBus::new(endpoint);

        {
            let _listener = bus.listen();
            assert_eq!(bus.listeners.len(), 1);
        }
        assert_eq!(bus.listeners.len(), 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unmatched_reply_produces_no_state_change() {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        let bus = MessageBus::new(endpoint);
        let mut listener = bus.listen();

        // Trigger a reply for an id nobody is waiting on.
        bus.send(Envelope::new("ghost", MessageKind::ListTables))
            .unwrap();

        let reply = with_timeout(listener.recv()).await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);

        // A fresh client still operates normally afterwards.
        let client = PackageClient::new(Arc::clone(&bus), "pkg-1");
        with_timeout(client.open_bytes(sample_package_bytes()))
            .await
            .unwrap();

        handle.stop().await;
    }
}
