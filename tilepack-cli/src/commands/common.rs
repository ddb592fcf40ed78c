//! Shared wiring for CLI commands.

use std::ffi::OsStr;
use std::sync::Arc;

use tilepack::config::ConfigFile;
use tilepack::protocol::ipc::spawn_worker_process;
use tilepack::protocol::{Envelope, MessageKind, Payload};
use tilepack::worker::spawn_in_process;
use tilepack::{MemoryLibrary, MessageBus, WorkerHandle};
use tracing::info;

use crate::error::CliError;

/// Keeps the worker alive for the duration of a command, whichever
/// binding is active.
pub enum WorkerRuntime {
    /// Background task in this process.
    InProcess(WorkerHandle),
    /// Child process; killed on drop.
    Child(tokio::process::Child),
}

impl WorkerRuntime {
    /// Shuts the worker down cleanly where the binding supports it.
    pub async fn shutdown(self) {
        match self {
            WorkerRuntime::InProcess(handle) => handle.stop().await,
            // Dropping the child closes its stdin; kill_on_drop covers
            // the rest.
            WorkerRuntime::Child(_) => {}
        }
    }
}

/// Loads the user config, tolerating a missing file.
pub fn load_config() -> Result<ConfigFile, CliError> {
    ConfigFile::load().map_err(|e| CliError::Config(e.to_string()))
}

/// Connects a message bus to a worker over the selected binding.
pub async fn connect(ipc: bool) -> Result<(Arc<MessageBus>, WorkerRuntime), CliError> {
    let config = load_config()?;

    if !ipc {
        let (endpoint, handle) = spawn_in_process(Arc::new(MemoryLibrary));
        info!("Package worker running as background task");
        return Ok((MessageBus::new(endpoint), WorkerRuntime::InProcess(handle)));
    }

    let program = match &config.worker.worker_binary {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };

    let (endpoint, child) = spawn_worker_process(
        &program,
        &[OsStr::new("worker")],
        config.worker.max_frame_bytes,
    )?;
    info!(program = %program.display(), "Package worker running as child process");

    let bus = MessageBus::new(endpoint);

    // Bootstrap the worker; no reply is expected.
    bus.send(Envelope::with_payload(
        "bootstrap",
        MessageKind::OpenLibrary,
        Payload {
            path: config.worker.scratch_dir.clone(),
            ..Default::default()
        },
    ))?;

    Ok((bus, WorkerRuntime::Child(child)))
}

/// Parses a `west,south,east,north` extent argument.
pub fn parse_extent(value: &str) -> Result<[f64; 4], CliError> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| {
            CliError::InvalidArgs(format!(
                "extent must be four numbers 'west,south,east,north', got '{value}'"
            ))
        })?;

    match <[f64; 4]>::try_from(parts) {
        Ok(extent) => Ok(extent),
        Err(_) => Err(CliError::InvalidArgs(
            "extent must have exactly four values".to_string(),
        )),
    }
}
