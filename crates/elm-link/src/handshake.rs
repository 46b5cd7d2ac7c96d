//! Adapter initialization handshake
//!
//! Runs before any background task exists, so it drives the transport
//! directly instead of going through the queues.

use crate::error::{HandshakeFailure, LinkError};
use elm_protocol::{encode_command, make_visible, InitStep, ProtocolError, Transport};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Run `steps` in order, stopping at the first failure.
///
/// Each step writes its command, waits the settle delay, then takes the
/// first chunk of bytes to arrive within the step timeout as its reply.
/// Steps are never retried. The transport is left open either way.
pub(crate) async fn run(
    transport: &mut dyn Transport,
    steps: &[InitStep],
    poll: Duration,
) -> Result<(), LinkError> {
    for step in steps {
        debug!("INPUT -> {}", step.command);
        transport.write_bytes(&encode_command(step.command))?;
        sleep(step.settle).await;

        let response = match timeout(step.timeout, await_response(transport, poll)).await {
            Ok(response) => response?,
            Err(_) => {
                warn!("Init fail: {} (no response)", step.command);
                return Err(LinkError::Handshake {
                    command: step.command,
                    reason: HandshakeFailure::Timeout(step.timeout.as_millis() as u64),
                });
            }
        };

        let visible = make_visible(&response);
        if !step.accepts(&String::from_utf8_lossy(&response)) {
            warn!("Init fail: {} -> {}", step.command, visible);
            return Err(LinkError::Handshake {
                command: step.command,
                reason: HandshakeFailure::Rejected(visible),
            });
        }

        debug!("OUTPUT <- {}: {}", step.command, visible);
    }

    Ok(())
}

async fn await_response(
    transport: &mut dyn Transport,
    poll: Duration,
) -> Result<Vec<u8>, ProtocolError> {
    loop {
        if let Some(bytes) = transport.read_available()? {
            return Ok(bytes);
        }
        sleep(poll).await;
    }
}
