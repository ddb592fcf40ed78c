//! Export sub-command handlers.
//!
//! One export job runs against a fresh package registered under the job's
//! correlation id: tables are created from supplied column lists, feature
//! batches stream in per table (with periodic progress replies), the
//! finished package is serialized to a buffer, and the buffer is handed
//! back chunk by chunk until write-finish tears the job down.

use std::path::PathBuf;

use bytes::Bytes;
use chrono::DateTime;
use tracing::{debug, info, warn};

use super::{HandlerResult, ReplySink, WorkerContext};
use crate::catalog::ColumnType;
use crate::package::{ColumnSpec, ColumnValue, FeatureRecord, GeometryColumnSpec};
use crate::protocol::{ChunkPolicy, Envelope, ExportCommand, MessageKind, Payload, ReplyData};

/// Source field that expands into the paired timestamp columns.
const RECORD_TIME_FIELD: &str = "recordTime";

/// Start timestamp column stamped on exported features.
pub const TIME_START_FIELD: &str = "TIME_START";

/// Stop timestamp column stamped on exported features.
pub const TIME_STOP_FIELD: &str = "TIME_STOP";

/// Serialized output buffer of one export job, with the chunk read cursor.
#[derive(Debug)]
pub(crate) struct ExportOutput {
    data: Bytes,
    cursor: usize,
}

impl ExportOutput {
    fn new(data: Bytes) -> Self {
        Self { data, cursor: 0 }
    }

    /// Next slice under the given policy. An empty slice signals
    /// end-of-data.
    fn next_chunk(&mut self, policy: ChunkPolicy) -> Bytes {
        match policy {
            ChunkPolicy::WholeBuffer => {
                if self.cursor == 0 && !self.data.is_empty() {
                    self.cursor = self.data.len();
                    self.data.clone()
                } else {
                    Bytes::new()
                }
            }
            ChunkPolicy::Bounded(limit) => {
                let end = (self.cursor + limit).min(self.data.len());
                let chunk = self.data.slice(self.cursor..end);
                self.cursor = end;
                chunk
            }
        }
    }
}

/// Transient worker-side state for one export job.
#[derive(Debug, Default)]
pub struct ExportJob {
    /// Internal artifact to delete at write-finish; `None` when the caller
    /// supplied a visible path.
    scratch: Option<PathBuf>,
    /// Serialized buffer, present once `write` has run.
    pub(crate) output: Option<ExportOutput>,
}

impl ExportJob {
    fn new(scratch: Option<PathBuf>) -> Self {
        Self {
            scratch,
            output: None,
        }
    }
}

/// Top-level export dispatcher: routes on the payload's sub-command.
pub(crate) fn export(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    let command = env.payload.command.ok_or("command must be set")?;

    match command {
        ExportCommand::Create => create(ctx, env, sink),
        ExportCommand::CreateTable => create_table(ctx, env, sink),
        ExportCommand::FeatureBatch => feature_batch(ctx, env, sink),
        ExportCommand::Write => write(ctx, env, sink),
        ExportCommand::GetChunk => get_chunk(ctx, env, sink),
        ExportCommand::WriteFinish => write_finish(ctx, env, sink),
        // Progress flows worker → controller only.
        ExportCommand::Progress => Err("unknown export command".into()),
    }
}

/// Opens a fresh package for the job and registers it under the job id.
/// A path-less create lands in the scratch directory and is cleaned up at
/// write-finish.
fn create(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    if env.id.is_empty() {
        return Err("id must be set".into());
    }

    let (path, scratch) = match &env.payload.path {
        Some(path) => (path.clone(), None),
        None => {
            let path = ctx.scratch_dir.join(format!("{}.tmp.tilepack", env.id));
            (path.clone(), Some(path))
        }
    };

    let package = ctx.library.create(&path)?;
    info!(id = %env.id, path = %path.display(), "Created export package");

    ctx.sessions.install(env.id.clone(), package);
    ctx.exports.insert(env.id.clone(), ExportJob::new(scratch));

    sink.success(env, None);
    Ok(())
}

/// Materializes one destination table: a primary key, a geometry column,
/// and one column per supplied field.
fn create_table(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    let table = env
        .payload
        .table_name
        .as_deref()
        .ok_or("table_name must be set")?;
    let columns = env
        .payload
        .columns
        .as_ref()
        .ok_or("columns must be set")?;

    let specs = map_export_columns(columns);

    let package = ctx
        .sessions
        .get_mut(&env.id)
        .ok_or("no open package for id")?;
    package.create_feature_table(table, GeometryColumnSpec::generic("geometry"), specs)?;

    debug!(id = %env.id, table = %table, "Created export table");
    sink.success(env, None);
    Ok(())
}

/// Inserts one table's buffered features in a single call, emitting
/// periodic progress replies followed by one completion reply.
fn feature_batch(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    let table = env
        .payload
        .table_name
        .as_deref()
        .ok_or("table_name must be set")?;
    let features = env
        .payload
        .features
        .clone()
        .ok_or("features must be set")?;

    // Timestamp fields arrive as ISO-8601 text; the package stores native
    // datetime values.
    let features = parse_temporal_fields(features)?;

    let interval = ctx.progress_interval;
    let package = ctx
        .sessions
        .get_mut(&env.id)
        .ok_or("no open package for id")?;

    let mut emit = |count: u64| {
        let progress = Envelope::with_payload(
            env.id.clone(),
            MessageKind::Export,
            Payload {
                command: Some(ExportCommand::Progress),
                table_name: Some(table.to_string()),
                count: Some(count),
                ..Default::default()
            },
        );
        sink.success(&progress, Some(ReplyData::Progress(count)));
    };

    let inserted = package.insert_features(table, features, interval, &mut emit)?;

    debug!(id = %env.id, table = %table, inserted, "Inserted feature batch");
    sink.success(env, None);
    Ok(())
}

/// Serializes the full package to the job's output buffer, cursor reset to
/// zero.
fn write(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    let package = ctx.sessions.get(&env.id).ok_or("no open package for id")?;
    let data = package.export_bytes()?;

    let job = ctx
        .exports
        .get_mut(&env.id)
        .ok_or("an export for the id has not been started")?;

    info!(id = %env.id, bytes = data.len(), "Serialized export package");
    job.output = Some(ExportOutput::new(data));

    sink.success(env, None);
    Ok(())
}

/// Returns the next slice of the job's output buffer. An empty chunk tells
/// the controller all data has been delivered.
fn get_chunk(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    if env.id.is_empty() {
        return Err("id must be set".into());
    }

    let policy = ctx.chunk_policy;
    let output = ctx
        .exports
        .get_mut(&env.id)
        .and_then(|job| job.output.as_mut())
        .ok_or("an export for the id has not been started")?;

    let chunk = output.next_chunk(policy);
    sink.success(env, Some(ReplyData::Chunk(chunk)));
    Ok(())
}

/// Tears the job down: closes the session, deletes any scratch artifact,
/// and discards job state.
fn write_finish(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    ctx.sessions.close(&env.id);

    if let Some(job) = ctx.exports.remove(&env.id) {
        if let Some(path) = job.scratch {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Could not remove export scratch file");
            } else {
                debug!(path = %path.display(), "Removed export scratch file");
            }
        }
    }

    sink.success(env, None);
    Ok(())
}

/// Maps caller-supplied columns to table specs.
///
/// Skips fields the worker materializes itself (`id`, `geometry`, the
/// timestamp pair) and expands the single temporal field into paired
/// `TIME_START`/`TIME_STOP` datetime columns.
fn map_export_columns(columns: &[crate::protocol::ExportColumn]) -> Vec<ColumnSpec> {
    let mut specs = Vec::new();

    for column in columns {
        let lower = column.field.to_lowercase();
        if lower == "id"
            || lower == "geometry"
            || column.field == TIME_START_FIELD
            || column.field == TIME_STOP_FIELD
        {
            continue;
        }

        if column.field == RECORD_TIME_FIELD {
            for name in [TIME_START_FIELD, TIME_STOP_FIELD] {
                specs.push(ColumnSpec {
                    name: name.to_string(),
                    column_type: ColumnType::DateTime,
                    not_null: false,
                    default: None,
                });
            }
            continue;
        }

        let (column_type, default) = match column.column_type.to_lowercase().as_str() {
            "decimal" => (ColumnType::Real, None),
            "integer" => (ColumnType::Integer, None),
            // Datetime values ride as text and are parsed at insert.
            "datetime" => (ColumnType::Text, None),
            _ => (ColumnType::Text, Some(ColumnValue::Text(String::new()))),
        };

        specs.push(ColumnSpec {
            name: column.field.clone(),
            column_type,
            not_null: false,
            default,
        });
    }

    specs
}

/// Parses ISO-8601 `TIME_START`/`TIME_STOP` text properties into native
/// datetime values.
fn parse_temporal_fields(
    mut features: Vec<FeatureRecord>,
) -> Result<Vec<FeatureRecord>, super::HandlerError> {
    for feature in &mut features {
        for field in [TIME_START_FIELD, TIME_STOP_FIELD] {
            if let Some(ColumnValue::Text(value)) = feature.properties.get(field) {
                let parsed = DateTime::parse_from_rfc3339(value)
                    .map_err(|e| format!("invalid {field} value: {e}"))?;
                feature
                    .properties
                    .insert(field.to_string(), ColumnValue::DateTime(parsed.timestamp_millis()));
            }
        }
    }
    Ok(features)
}
