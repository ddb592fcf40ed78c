//! `tilepack worker` - hidden child-process entry point for `--ipc`.
//!
//! Speaks length-delimited frames over stdin/stdout and runs until the
//! parent closes the pipe.

use std::sync::Arc;

use clap::Args;
use tilepack::protocol::ipc::stdio_worker_endpoint;
use tilepack::protocol::ChunkPolicy;
use tilepack::{MemoryLibrary, Worker};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::common::load_config;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Override the chunk slice bound in bytes
    #[arg(long)]
    pub chunk_bytes: Option<usize>,
}

pub async fn run(args: WorkerArgs) -> Result<(), CliError> {
    let config = load_config()?;

    let chunk_bytes = args.chunk_bytes.unwrap_or(config.export.chunk_bytes);
    let endpoint = stdio_worker_endpoint(config.worker.max_frame_bytes);

    let mut worker = Worker::new(
        Arc::new(MemoryLibrary),
        endpoint,
        ChunkPolicy::Bounded(chunk_bytes),
    )
    .with_progress_interval(config.export.progress_interval);

    if let Some(scratch) = &config.worker.scratch_dir {
        worker = worker.with_scratch_dir(scratch.clone());
    }

    info!(chunk_bytes, "Worker child started");

    // Runs until the parent closes stdin.
    worker.run(CancellationToken::new()).await;
    Ok(())
}
