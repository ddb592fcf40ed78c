//! CLI error type.

use thiserror::Error;

/// Errors surfaced to the CLI user.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid command-line input.
    #[error("{0}")]
    InvalidArgs(String),

    /// Configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// A protocol operation failed.
    #[error(transparent)]
    Client(#[from] tilepack::ClientError),

    /// The transport could not be set up.
    #[error(transparent)]
    Transport(#[from] tilepack::protocol::TransportError),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
