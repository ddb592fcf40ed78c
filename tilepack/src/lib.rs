//! Tilepack — worker-isolated access to file-backed geospatial packages.
//!
//! A package is a single self-contained file holding raster tile tables
//! and vector feature tables. Opening, querying, and writing one is CPU-
//! and I/O-heavy, so every package operation runs in an isolated worker —
//! a background task or a child process — and the controlling side talks
//! to it exclusively through asynchronous, correlated messages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────┐        ┌──────────────────────────────┐
//! │        controller        │        │            worker            │
//! │                          │        │                              │
//! │ PackageClient ──┐        │ frames │  dispatch ─► command table   │
//! │ TileFetcher ────┼─► bus ─┼────────┼─►   │                        │
//! │ Exporter ───────┘   ▲    │   or   │     ▼                        │
//! │                     │    │ chans  │  WorkerContext               │
//! │      replies ───────┘    │◄───────┼── sessions / scaling / jobs  │
//! └─────────────────────────┘        └──────────────┬───────────────┘
//!                                                    ▼
//!                                          package-format library
//! ```
//!
//! - [`protocol`] — the message envelope, correlation, and the two
//!   transport bindings (in-process channels, child-process stdio).
//! - [`worker`] — the command dispatch loop and all worker-owned state.
//! - [`client`] — the controller surface: sessions, tile fetches, and the
//!   multi-phase export pipeline.
//! - [`package`] — the boundary traits over the wrapped format library,
//!   plus the in-memory reference backend.
//! - [`coord`], [`catalog`] — extent normalization and descriptor repair.

pub mod catalog;
pub mod client;
pub mod config;
pub mod coord;
pub mod logging;
pub mod package;
pub mod protocol;
pub mod worker;

pub use client::{
    export::{ExportItem, ExportOptions, ExportPhase, ExportProgress, Exporter, TimeSpan},
    tiles::{TileFetch, TileFetcher, TileResult},
    ClientError, MessageBus, PackageClient,
};
pub use package::{MemoryLibrary, MemoryPackage, Package, PackageError, PackageLibrary};
pub use protocol::{ChunkPolicy, Envelope, MessageKind, Reply, ReplyStatus};
pub use worker::{spawn_in_process, Worker, WorkerHandle};
