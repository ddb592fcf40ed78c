//! Configuration file handling for `~/.tilepack/config.ini`.
//!
//! Loads user configuration with sensible defaults; CLI flags overlay
//! whatever the file supplies. Unknown sections and keys are ignored.

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use crate::protocol::DEFAULT_CHUNK_BYTES;
use crate::worker::DEFAULT_PROGRESS_INTERVAL;

/// Default upper bound on one IPC frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = crate::protocol::ipc::DEFAULT_MAX_FRAME_BYTES;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read the config file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] ini::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        /// Section the key lives in.
        section: String,
        /// Offending key.
        key: String,
        /// Supplied value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// `[worker]` section: transport and scratch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Upper bound on one IPC frame in bytes.
    pub max_frame_bytes: usize,
    /// Directory for internal export artifacts; the system temp directory
    /// when unset.
    pub scratch_dir: Option<PathBuf>,
    /// Worker binary for the out-of-process binding; the current
    /// executable when unset.
    pub worker_binary: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            scratch_dir: None,
            worker_binary: None,
        }
    }
}

/// `[export]` section: export pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    /// Chunk slice bound for the out-of-process binding.
    pub chunk_bytes: usize,
    /// Insert count between progress replies.
    pub progress_interval: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// User configuration, as loaded from `config.ini`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    /// `[worker]` section.
    pub worker: WorkerSettings,
    /// `[export]` section.
    pub export: ExportSettings,
}

impl ConfigFile {
    /// Loads configuration from the default path
    /// (`~/.tilepack/config.ini`), falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Loads configuration from a specific path. A missing file yields
    /// defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)?;
        parse_ini(&ini)
    }
}

/// Default config file location.
pub fn config_file_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tilepack")
        .join("config.ini")
}

/// Overlays INI values onto the defaults.
fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    if let Some(section) = ini.section(Some("worker")) {
        if let Some(v) = section.get("max_frame_bytes") {
            config.worker.max_frame_bytes =
                parse_positive(v, "worker", "max_frame_bytes")?;
        }
        if let Some(v) = section.get("scratch_dir") {
            let v = v.trim();
            if !v.is_empty() {
                config.worker.scratch_dir = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = section.get("worker_binary") {
            let v = v.trim();
            if !v.is_empty() {
                config.worker.worker_binary = Some(PathBuf::from(v));
            }
        }
    }

    if let Some(section) = ini.section(Some("export")) {
        if let Some(v) = section.get("chunk_bytes") {
            config.export.chunk_bytes = parse_positive(v, "export", "chunk_bytes")?;
        }
        if let Some(v) = section.get("progress_interval") {
            config.export.progress_interval =
                parse_positive(v, "export", "progress_interval")?;
        }
    }

    Ok(config)
}

fn parse_positive(value: &str, section: &str, key: &str) -> Result<usize, ConfigFileError> {
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigFileError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: "must be a positive integer".to_string(),
        }),
    }
}
