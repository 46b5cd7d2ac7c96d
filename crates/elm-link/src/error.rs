//! Connection Error Types

use crate::state::ConnectionState;
use elm_protocol::ProtocolError;
use thiserror::Error;

/// Why a handshake step failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
    /// No reply within the step timeout
    #[error("No response after {0}ms")]
    Timeout(u64),

    /// Reply did not satisfy the step validator
    #[error("Unexpected response {0:?}")]
    Rejected(String),
}

/// Errors that can occur while establishing or using a connection
#[derive(Debug, Error)]
pub enum LinkError {
    /// Transport could not be opened at the requested configuration
    #[error("Could not open transport: {0}")]
    Open(ProtocolError),

    /// An initialization step timed out or was rejected
    #[error("Handshake failed at {command}: {reason}")]
    Handshake {
        command: &'static str,
        reason: HandshakeFailure,
    },

    /// Unexpected I/O error on the transport
    #[error("Transport fault: {0}")]
    Transport(#[from] ProtocolError),

    /// Operation attempted after close
    #[error("Connection queues are closed")]
    QueueClosed,

    /// Operation not valid in the current lifecycle state
    #[error("Connection is {0}")]
    InvalidState(ConnectionState),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_messages() {
        let timeout = LinkError::Handshake {
            command: "ATZ",
            reason: HandshakeFailure::Timeout(2000),
        };
        assert_eq!(
            timeout.to_string(),
            "Handshake failed at ATZ: No response after 2000ms"
        );

        let rejected = HandshakeFailure::Rejected("?\\r>".to_string());
        assert_eq!(rejected.to_string(), "Unexpected response \"?\\\\r>\"");
    }
}
