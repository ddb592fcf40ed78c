//! Controller-side export pipeline.
//!
//! One export job is a cooperative state machine run against the worker:
//!
//! ```text
//! Idle → Created → TablesPending → Streaming → Writing → ChunkingOut → Finished
//!                        │              │          │           │
//!                        └──────────────┴──────────┴───────────┴──► Errored
//! ```
//!
//! The controller partitions its pending features by destination table,
//! creates each distinct table, streams each table's batch once that
//! table's creation is acknowledged, and advances a phase only when every
//! expected acknowledgment for the current phase has arrived — tables may
//! complete in any order. The finished binary is retrieved in bounded
//! chunks and reassembled; an error reply in any phase aborts only this
//! job and releases the bus listener.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat};
use tracing::{debug, info, warn};

use super::{ClientError, MessageBus};
use crate::package::{ColumnValue, FeatureRecord};
use crate::protocol::{
    CorrelationId, Envelope, ExportColumn, ExportCommand, MessageKind, Payload, ReplyData,
};
use crate::worker::{TIME_START_FIELD, TIME_STOP_FIELD};

/// Monotonic job id allocator; ids look like `export7`.
static EXPORT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Time span stamped onto exported features, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    /// Start instant.
    pub start: i64,
    /// End instant for ranges; `None` for instants.
    pub stop: Option<i64>,
}

/// One feature queued for export, tagged with its destination table (the
/// owning data-source's display title, resolved by the caller).
#[derive(Debug, Clone)]
pub struct ExportItem {
    /// Destination table name.
    pub table: String,
    /// The feature to insert.
    pub feature: FeatureRecord,
    /// Temporal value stamped into the timestamp columns, when present.
    pub time: Option<TimeSpan>,
}

/// Caller-tunable export parameters.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Caller-visible output path; the worker uses an internal scratch
    /// location when empty.
    pub path: Option<PathBuf>,
    /// Column lists per destination table. Tables without an entry get
    /// columns derived from their features.
    pub columns: BTreeMap<String, Vec<ExportColumn>>,
}

/// Phases of one export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    /// No job started.
    Idle,
    /// Waiting for the worker to open the fresh package.
    Created,
    /// Waiting for table-creation acknowledgments.
    TablesPending,
    /// Waiting for per-table feature batches to complete.
    Streaming,
    /// Waiting for the package to serialize.
    Writing,
    /// Retrieving the binary chunk by chunk.
    ChunkingOut,
    /// Binary assembled, job state discarded.
    Finished,
    /// An error reply aborted the job.
    Errored,
}

/// Running progress of one export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportProgress {
    /// Features exported so far, summed across tables.
    pub exported: u64,
    /// Total features submitted.
    pub total: u64,
}

impl ExportProgress {
    /// Exported-over-total as a fraction in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.exported as f64 / self.total as f64).min(1.0)
    }
}

/// Per-table bookkeeping while the job runs.
struct TableState {
    features: Vec<FeatureRecord>,
    completed: bool,
    exported: u64,
}

/// Drives one export job over the message bus.
pub struct Exporter {
    bus: Arc<MessageBus>,
    job_id: CorrelationId,
    phase: ExportPhase,
}

impl Exporter {
    /// Creates an exporter with a freshly allocated job id.
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let job_id = format!("export{}", EXPORT_SEQ.fetch_add(1, Ordering::Relaxed));
        Self {
            bus,
            job_id,
            phase: ExportPhase::Idle,
        }
    }

    /// The job's correlation id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The job's current phase.
    pub fn phase(&self) -> ExportPhase {
        self.phase
    }

    /// Runs the whole job and returns the assembled package binary.
    ///
    /// `on_progress` observes per-table progress aggregated into an
    /// overall count; tables complete in any order.
    pub async fn run(
        &mut self,
        items: Vec<ExportItem>,
        options: ExportOptions,
        mut on_progress: impl FnMut(ExportProgress),
    ) -> Result<Bytes, ClientError> {
        // Register before the first send so no reply can be missed.
        let mut listener = self.bus.listen();

        let total = items.len() as u64;
        let mut tables = partition_items(items)?;

        info!(
            job = %self.job_id,
            features = total,
            tables = tables.len(),
            "Starting export job"
        );

        self.phase = ExportPhase::Created;
        self.send(ExportCommand::Create, |payload| {
            payload.path = options.path.clone();
        })?;

        let mut output = BytesMut::new();

        loop {
            let Some(reply) = listener.recv().await else {
                self.phase = ExportPhase::Errored;
                return Err(ClientError::ChannelClosed);
            };

            if !reply.answers(&self.job_id, MessageKind::Export) {
                continue;
            }

            if !reply.is_success() {
                let reason = reply.reason.clone().unwrap_or_default();
                warn!(job = %self.job_id, reason = %reason, "Export job failed");
                self.phase = ExportPhase::Errored;
                // Returning drops the listener, releasing the bus
                // registration; no further commands are sent.
                return Err(ClientError::Worker(reason));
            }

            match reply.request.payload.command {
                Some(ExportCommand::Create) => {
                    self.phase = ExportPhase::TablesPending;

                    if tables.is_empty() {
                        self.phase = ExportPhase::Writing;
                        self.send(ExportCommand::Write, |_| {})?;
                        continue;
                    }

                    for (table, state) in &tables {
                        let columns = options
                            .columns
                            .get(table)
                            .cloned()
                            .unwrap_or_else(|| derive_columns(&state.features));

                        self.send(ExportCommand::CreateTable, |payload| {
                            payload.table_name = Some(table.clone());
                            payload.columns = Some(columns);
                        })?;
                    }
                }

                Some(ExportCommand::CreateTable) => {
                    let Some(table) = reply.request.payload.table_name.clone() else {
                        continue;
                    };
                    self.phase = ExportPhase::Streaming;

                    if let Some(state) = tables.get(&table) {
                        debug!(job = %self.job_id, table = %table, "Streaming feature batch");
                        let features = state.features.clone();
                        self.send(ExportCommand::FeatureBatch, |payload| {
                            payload.table_name = Some(table.clone());
                            payload.features = Some(features);
                        })?;
                    }
                }

                Some(ExportCommand::Progress) => {
                    let Some(table) = reply.request.payload.table_name.as_deref() else {
                        continue;
                    };
                    if let Some(state) = tables.get_mut(table) {
                        state.exported = reply.request.payload.count.unwrap_or(0);
                        on_progress(progress_of(&tables, total));
                    }
                }

                Some(ExportCommand::FeatureBatch) => {
                    let Some(table) = reply.request.payload.table_name.as_deref() else {
                        continue;
                    };
                    if let Some(state) = tables.get_mut(table) {
                        state.completed = true;
                        state.exported = state.features.len() as u64;
                        on_progress(progress_of(&tables, total));
                    }

                    // Advance only once every table's batch has completed.
                    if tables.values().all(|state| state.completed) {
                        self.phase = ExportPhase::Writing;
                        self.send(ExportCommand::Write, |_| {})?;
                    }
                }

                Some(ExportCommand::Write) => {
                    self.phase = ExportPhase::ChunkingOut;
                    self.send(ExportCommand::GetChunk, |_| {})?;
                }

                Some(ExportCommand::GetChunk) => {
                    let Some(ReplyData::Chunk(chunk)) = &reply.result else {
                        self.phase = ExportPhase::Errored;
                        return Err(ClientError::UnexpectedReply);
                    };

                    if chunk.is_empty() {
                        // End-of-data: every chunk has been delivered.
                        self.send(ExportCommand::WriteFinish, |_| {})?;
                    } else {
                        output.extend_from_slice(chunk);
                        self.send(ExportCommand::GetChunk, |_| {})?;
                    }
                }

                Some(ExportCommand::WriteFinish) => {
                    self.phase = ExportPhase::Finished;
                    info!(job = %self.job_id, bytes = output.len(), "Export job finished");
                    return Ok(output.freeze());
                }

                _ => {}
            }
        }
    }

    fn send(
        &self,
        command: ExportCommand,
        fill: impl FnOnce(&mut Payload),
    ) -> Result<(), ClientError> {
        let mut payload = Payload {
            command: Some(command),
            ..Default::default()
        };
        fill(&mut payload);

        self.bus
            .send(Envelope::with_payload(
                self.job_id.as_str(),
                MessageKind::Export,
                payload,
            ))
            .map_err(ClientError::from)
    }
}

/// Buckets items by destination table, stamping the timestamp columns from
/// each feature's temporal value.
fn partition_items(
    items: Vec<ExportItem>,
) -> Result<BTreeMap<String, TableState>, ClientError> {
    let mut tables: BTreeMap<String, TableState> = BTreeMap::new();

    for item in items {
        let mut feature = item.feature;

        if let Some(time) = item.time {
            feature.properties.insert(
                TIME_START_FIELD.to_string(),
                ColumnValue::Text(iso_timestamp(time.start)?),
            );
            if let Some(stop) = time.stop {
                feature.properties.insert(
                    TIME_STOP_FIELD.to_string(),
                    ColumnValue::Text(iso_timestamp(stop)?),
                );
            }
        }

        tables
            .entry(item.table)
            .or_insert_with(|| TableState {
                features: Vec::new(),
                completed: false,
                exported: 0,
            })
            .features
            .push(feature);
    }

    Ok(tables)
}

fn progress_of(tables: &BTreeMap<String, TableState>, total: u64) -> ExportProgress {
    ExportProgress {
        exported: tables.values().map(|state| state.exported).sum(),
        total,
    }
}

fn iso_timestamp(millis: i64) -> Result<String, ClientError> {
    DateTime::from_timestamp_millis(millis)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| ClientError::Input(format!("timestamp out of range: {millis}")))
}

/// Derives a column list from the features themselves, for tables the
/// caller supplied no explicit columns for.
fn derive_columns(features: &[FeatureRecord]) -> Vec<ExportColumn> {
    let mut columns: BTreeMap<&str, &'static str> = BTreeMap::new();

    for feature in features {
        for (name, value) in &feature.properties {
            let label = match value {
                ColumnValue::Real(_) => "decimal",
                ColumnValue::Integer(_) => "integer",
                ColumnValue::DateTime(_) => "datetime",
                _ => "string",
            };
            columns.entry(name.as_str()).or_insert(label);
        }
    }

    columns
        .into_iter()
        .map(|(field, column_type)| ExportColumn {
            field: field.to_string(),
            column_type: column_type.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Geometry, MemoryLibrary};
    use crate::protocol::{channel_pair, ChunkPolicy};
    use crate::worker::Worker;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn spawn_worker(
        chunk_policy: ChunkPolicy,
        progress_interval: usize,
        scratch: &std::path::Path,
    ) -> (Arc<MessageBus>, CancellationToken) {
        let (controller, worker_endpoint) = channel_pair();
        let worker = Worker::new(Arc::new(MemoryLibrary), worker_endpoint, chunk_policy)
            .with_scratch_dir(scratch.to_path_buf())
            .with_progress_interval(progress_interval);

        let shutdown = CancellationToken::new();
        tokio::spawn(worker.run(shutdown.clone()));

        (MessageBus::new(controller), shutdown)
    }

    fn items(table: &str, count: usize) -> Vec<ExportItem> {
        (0..count)
            .map(|i| ExportItem {
                table: table.to_string(),
                feature: FeatureRecord::with_geometry(Geometry::Point([i as f64, 0.0]))
                    .property("name", ColumnValue::Text(format!("{table}-{i}"))),
                time: Some(TimeSpan {
                    start: 1_700_000_000_000 + i as i64,
                    stop: if i % 2 == 0 {
                        Some(1_700_000_100_000 + i as i64)
                    } else {
                        None
                    },
                }),
            })
            .collect()
    }

    async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("export completes within timeout")
    }

    #[tokio::test]
    async fn test_export_two_tables_reassembles_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, shutdown) = spawn_worker(ChunkPolicy::Bounded(256), 7, dir.path());

        let mut all_items = items("alpha", 20);
        all_items.extend(items("beta", 5));

        let mut exporter = Exporter::new(Arc::clone(&bus));
        let mut last_progress = ExportProgress {
            exported: 0,
            total: 0,
        };

        let bytes = with_timeout(exporter.run(
            all_items,
            ExportOptions::default(),
            |progress| last_progress = progress,
        ))
        .await
        .unwrap();

        assert_eq!(exporter.phase(), ExportPhase::Finished);
        assert!(!bytes.is_empty());

        // Sum of per-table counts equals the total submitted.
        assert_eq!(last_progress.exported, 25);
        assert_eq!(last_progress.total, 25);
        assert_eq!(last_progress.fraction(), 1.0);

        // The buffer is a readable package holding both tables and every
        // feature.
        let reopened = crate::package::PackageLibrary::open_bytes(&MemoryLibrary, bytes).unwrap();
        assert_eq!(
            reopened.feature_tables(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
        let alpha: Vec<_> = reopened
            .features("alpha")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(alpha.len(), 20);

        // Timestamp text was parsed into native datetimes by the worker.
        assert!(matches!(
            alpha[0].properties.get(TIME_START_FIELD),
            Some(ColumnValue::DateTime(_))
        ));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_export_whole_buffer_matches_bounded_chunks() {
        let dir = tempfile::tempdir().unwrap();

        let (bounded_bus, bounded_shutdown) =
            spawn_worker(ChunkPolicy::Bounded(64), 1000, dir.path());
        let (whole_bus, whole_shutdown) =
            spawn_worker(ChunkPolicy::WholeBuffer, 1000, dir.path());

        let bounded = with_timeout(Exporter::new(bounded_bus).run(
            items("tracks", 10),
            ExportOptions::default(),
            |_| {},
        ))
        .await
        .unwrap();

        let whole = with_timeout(Exporter::new(whole_bus).run(
            items("tracks", 10),
            ExportOptions::default(),
            |_| {},
        ))
        .await
        .unwrap();

        // Identical inputs reconstruct identical binaries across both
        // transport variants.
        assert_eq!(bounded, whole);

        bounded_shutdown.cancel();
        whole_shutdown.cancel();
    }

    #[tokio::test]
    async fn test_progress_replies_arrive_per_table() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, shutdown) = spawn_worker(ChunkPolicy::Bounded(256), 4, dir.path());

        let mut all_items = items("alpha", 9);
        all_items.extend(items("beta", 6));

        let mut observations = Vec::new();
        let mut exporter = Exporter::new(bus);
        with_timeout(exporter.run(all_items, ExportOptions::default(), |progress| {
            observations.push(progress.exported)
        }))
        .await
        .unwrap();

        // Periodic counts from both tables plus the two completions.
        assert!(observations.len() >= 3);
        assert_eq!(*observations.last().unwrap(), 15);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_empty_export_produces_empty_package() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, shutdown) = spawn_worker(ChunkPolicy::WholeBuffer, 1000, dir.path());

        let mut exporter = Exporter::new(bus);
        let bytes = with_timeout(exporter.run(Vec::new(), ExportOptions::default(), |_| {}))
            .await
            .unwrap();

        let reopened = crate::package::PackageLibrary::open_bytes(&MemoryLibrary, bytes).unwrap();
        assert!(reopened.feature_tables().is_empty());
        assert_eq!(exporter.phase(), ExportPhase::Finished);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_error_reply_aborts_job() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, shutdown) = spawn_worker(ChunkPolicy::WholeBuffer, 1000, dir.path());

        // Two items for the same table: the duplicate create-table is
        // avoided by bucketing, so force an error with an invalid
        // timestamp instead.
        let bad_items = vec![ExportItem {
            table: "alpha".to_string(),
            feature: FeatureRecord::default().property(
                TIME_START_FIELD,
                ColumnValue::Text("not-a-timestamp".to_string()),
            ),
            time: None,
        }];

        let mut exporter = Exporter::new(bus);
        let err = with_timeout(exporter.run(bad_items, ExportOptions::default(), |_| {}))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Worker(_)));
        assert_eq!(exporter.phase(), ExportPhase::Errored);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_export_ids_are_unique() {
        let (endpoint, _worker) = channel_pair();
        let bus = MessageBus::new(endpoint);

        let first = Exporter::new(Arc::clone(&bus));
        let second = Exporter::new(bus);
        assert_ne!(first.job_id(), second.job_id());
        assert!(first.job_id().starts_with("export"));
    }

    #[test]
    fn test_derive_columns_from_values() {
        let features = vec![FeatureRecord::default()
            .property("alt", ColumnValue::Real(1.5))
            .property("count", ColumnValue::Integer(3))
            .property("name", ColumnValue::Text("x".to_string()))];

        let columns = derive_columns(&features);
        let by_field: BTreeMap<_, _> = columns
            .iter()
            .map(|c| (c.field.as_str(), c.column_type.as_str()))
            .collect();

        assert_eq!(by_field["alt"], "decimal");
        assert_eq!(by_field["count"], "integer");
        assert_eq!(by_field["name"], "string");
    }

    #[test]
    fn test_progress_fraction() {
        let progress = ExportProgress {
            exported: 5,
            total: 20,
        };
        assert_eq!(progress.fraction(), 0.25);

        let done = ExportProgress {
            exported: 0,
            total: 0,
        };
        assert_eq!(done.fraction(), 1.0);
    }
}
