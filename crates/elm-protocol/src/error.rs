//! Transport-level error types

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::Transport)
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The port could not be opened with the requested settings
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    /// An operation needed an open port
    #[error("Transport is not open")]
    NotOpen,

    /// I/O error while reading or writing
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_serial::Error> for ProtocolError {
    fn from(err: tokio_serial::Error) -> Self {
        ProtocolError::Io(err.into())
    }
}
