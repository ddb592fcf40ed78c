//! Worker-side command dispatch.
//!
//! The worker owns all mutable package state — the session registry, the
//! per-table tile scaling policies, and pending export jobs — in a single
//! [`WorkerContext`] passed by reference to command handlers. Inbound
//! envelopes are dispatched through a registered command table; a kind
//! with no registered handler produces an "unknown message kind" error
//! reply, and any error a handler raises is caught at the dispatch
//! boundary and converted to an error reply rather than crashing the
//! worker.
//!
//! ```text
//! Envelope ──► dispatch ──► command table ──► handler ──► ReplySink
//!                  │                              │
//!                  └── unknown kind ── error ◄────┘ Err(reason)
//! ```

mod export;
mod handlers;
mod session;
mod tile;

pub use export::{ExportJob, TIME_START_FIELD, TIME_STOP_FIELD};
pub use session::SessionRegistry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::package::{PackageError, PackageLibrary, TileScaling};
use crate::protocol::{
    channel_pair, ChunkPolicy, ControllerEndpoint, CorrelationId, Envelope, MessageKind, Reply,
    ReplyData, WorkerEndpoint,
};

/// Default insert count between export progress replies.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 10_000;

/// Failure reason raised by a command handler, converted to an error reply
/// at the dispatch boundary.
#[derive(Debug)]
pub(crate) struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<PackageError> for HandlerError {
    fn from(error: PackageError) -> Self {
        Self(error.to_string())
    }
}

pub(crate) type HandlerResult = Result<(), HandlerError>;

/// A registered command handler.
pub(crate) type Handler = fn(&mut WorkerContext, &Envelope, &ReplySink) -> HandlerResult;

/// The worker's registered command table.
pub(crate) type CommandTable = HashMap<MessageKind, Handler>;

/// Outbound reply channel handed to command handlers.
///
/// Replies echo the request that produced them with large payload fields
/// removed — raw package bytes and feature batches never travel back.
#[derive(Clone)]
pub struct ReplySink {
    tx: mpsc::UnboundedSender<Reply>,
}

impl ReplySink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Reply>) -> Self {
        Self { tx }
    }

    /// Sends a success reply for `request`.
    pub fn success(&self, request: &Envelope, result: Option<ReplyData>) {
        self.send(Reply::success(request.stripped(), result));
    }

    /// Sends an error reply for `request`.
    pub fn error(&self, request: &Envelope, reason: impl Into<String>) {
        self.send(Reply::error(request, reason));
    }

    fn send(&self, reply: Reply) {
        if self.tx.send(reply).is_err() {
            debug!("Controller side gone; dropping reply");
        }
    }
}

/// All mutable state the worker owns, passed by reference to handlers.
pub struct WorkerContext {
    /// Entry points of the package-format library.
    pub(crate) library: Arc<dyn PackageLibrary>,
    /// Open package handles keyed by correlation id.
    pub(crate) sessions: SessionRegistry,
    /// Per-table scaling policies, created once per tile table when a
    /// package is listed.
    pub(crate) tile_scaling: HashMap<String, TileScaling>,
    /// Pending export jobs keyed by correlation id.
    pub(crate) exports: HashMap<CorrelationId, ExportJob>,
    /// How export buffers are sliced for `get-chunk`.
    pub(crate) chunk_policy: ChunkPolicy,
    /// Directory for internal export artifacts.
    pub(crate) scratch_dir: PathBuf,
    /// Insert count between export progress replies.
    pub(crate) progress_interval: usize,
}

impl WorkerContext {
    /// Creates a context with default scratch and progress settings.
    pub fn new(library: Arc<dyn PackageLibrary>, chunk_policy: ChunkPolicy) -> Self {
        Self {
            library,
            sessions: SessionRegistry::new(),
            tile_scaling: HashMap::new(),
            exports: HashMap::new(),
            chunk_policy,
            scratch_dir: std::env::temp_dir(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Builds the worker's command table.
///
/// Reply kinds and anything else absent from this table come back as
/// "unknown message kind".
pub(crate) fn command_table() -> CommandTable {
    let mut table: CommandTable = HashMap::new();
    table.insert(MessageKind::OpenLibrary, handlers::open_library);
    table.insert(MessageKind::Open, handlers::open);
    table.insert(MessageKind::Close, handlers::close);
    table.insert(MessageKind::ListTables, handlers::list_tables);
    table.insert(MessageKind::GetTile, tile::get_tile);
    table.insert(MessageKind::GetFeatures, handlers::get_features);
    table.insert(MessageKind::Export, export::export);
    table
}

/// Looks the envelope's kind up in the command table and runs the handler,
/// converting any failure into an error reply.
pub(crate) fn dispatch(
    ctx: &mut WorkerContext,
    table: &CommandTable,
    envelope: Envelope,
    sink: &ReplySink,
) {
    let Some(handler) = table.get(&envelope.kind) else {
        warn!(id = %envelope.id, kind = ?envelope.kind, "No handler registered");
        sink.error(&envelope, "unknown message kind");
        return;
    };

    if let Err(HandlerError(reason)) = handler(ctx, &envelope, sink) {
        debug!(id = %envelope.id, kind = ?envelope.kind, reason = %reason, "Command failed");
        sink.error(&envelope, reason);
    }
}

/// The long-running worker service.
///
/// Receives envelopes from its endpoint and dispatches them sequentially
/// in arrival order; independent requests are never reordered.
pub struct Worker {
    ctx: WorkerContext,
    endpoint: WorkerEndpoint,
    commands: CommandTable,
}

impl Worker {
    /// Creates a worker over the given endpoint.
    pub fn new(
        library: Arc<dyn PackageLibrary>,
        endpoint: WorkerEndpoint,
        chunk_policy: ChunkPolicy,
    ) -> Self {
        Self {
            ctx: WorkerContext::new(library, chunk_policy),
            endpoint,
            commands: command_table(),
        }
    }

    /// Overrides the scratch directory for internal export artifacts.
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.ctx.scratch_dir = dir;
        self
    }

    /// Overrides the insert count between export progress replies.
    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.ctx.progress_interval = interval;
        self
    }

    /// Runs the worker until shutdown is signalled or the controller side
    /// goes away. Open sessions are released on exit.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Package worker starting");

        let Self {
            mut ctx,
            mut endpoint,
            commands,
        } = self;

        let sink = ReplySink::new(endpoint.reply_sender());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Package worker shutting down");
                    break;
                }

                request = endpoint.recv() => {
                    match request {
                        Some(envelope) => {
                            dispatch(&mut ctx, &commands, envelope, &sink);
                        }
                        None => {
                            debug!("Controller side closed; stopping worker");
                            break;
                        }
                    }
                }
            }
        }

        ctx.sessions.close_all();
        info!("Package worker stopped");
    }
}

/// Handle to an in-process worker task.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signals shutdown and waits for the worker to stop.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.join.await;
    }

    /// The shutdown token, for wiring into a broader lifecycle.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Spawns a worker on the current runtime over the in-process binding and
/// returns the controller endpoint talking to it.
pub fn spawn_in_process(library: Arc<dyn PackageLibrary>) -> (ControllerEndpoint, WorkerHandle) {
    let (controller, worker_endpoint) = channel_pair();
    let worker = Worker::new(library, worker_endpoint, ChunkPolicy::in_process());

    let shutdown = CancellationToken::new();
    let join = tokio::spawn(worker.run(shutdown.clone()));

    (controller, WorkerHandle { shutdown, join })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::MemoryLibrary;
    use crate::protocol::ReplyStatus;
    use std::time::Duration;

    async fn next_reply(controller: &mut ControllerEndpoint) -> Reply {
        tokio::time::timeout(Duration::from_secs(1), controller.recv())
            .await
            .expect("reply within timeout")
            .expect("worker alive")
    }

    #[tokio::test]
    async fn test_unregistered_kind_gets_error_reply() {
        let mut ctx = WorkerContext::new(Arc::new(MemoryLibrary), ChunkPolicy::in_process());
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let sink = ReplySink::new(reply_tx);

        // A table with no handlers registered at all.
        let table = CommandTable::new();
        dispatch(
            &mut ctx,
            &table,
            Envelope::new("s1", MessageKind::ListTables),
            &sink,
        );

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.reason.as_deref(), Some("unknown message kind"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let (mut controller, handle) = spawn_in_process(Arc::new(MemoryLibrary));

        // list-tables against an id with no open session.
        controller
            .send(Envelope::new("nobody", MessageKind::ListTables))
            .unwrap();

        let reply = next_reply(&mut controller).await;
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.reason.as_deref(), Some("no open package for id"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let (controller, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        handle.stop().await;
        drop(controller);
    }

    #[tokio::test]
    async fn test_worker_stops_when_controller_drops() {
        let (controller, worker_endpoint) = channel_pair();
        let worker = Worker::new(
            Arc::new(MemoryLibrary),
            worker_endpoint,
            ChunkPolicy::in_process(),
        );

        let join = tokio::spawn(worker.run(CancellationToken::new()));
        drop(controller);

        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("worker ends when controller drops")
            .unwrap();
    }
}
