//! IO loop: the only task that touches the transport once connected
//!
//! Each iteration either writes the next queued request or, when nothing was
//! queued within the idle window, snapshots whatever inbound bytes are
//! available. A reply arriving while a write is in progress is picked up at
//! the next idle slot.
//!
//! The snapshot read does not reassemble frames: a reply that arrives in
//! several bursts becomes several response entries.

use crate::state::StateCell;
use elm_protocol::{encode_command, make_visible, ProtocolError, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct IoLoop {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) requests: mpsc::UnboundedReceiver<String>,
    pub(crate) responses: mpsc::UnboundedSender<String>,
    /// Copy of the first frame read, for the consumer task
    pub(crate) first_frame: Option<oneshot::Sender<String>>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) cancel: CancellationToken,
    pub(crate) idle_poll: Duration,
    pub(crate) max_faults: u32,
}

impl IoLoop {
    /// Run until cancelled, handing the transport back on exit
    pub(crate) async fn run(mut self) -> Box<dyn Transport> {
        info!("IO loop started on {}", self.transport.name());
        let cancel = self.cancel.clone();
        let mut faults = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.write_request(&request),
                    None => break,
                },
                _ = sleep(self.idle_poll) => self.poll_inbound(),
            };

            match result {
                Ok(()) => faults = 0,
                Err(e) => {
                    faults += 1;
                    warn!("Transport fault {}/{}: {}", faults, self.max_faults, e);
                }
            }

            if faults >= self.max_faults {
                error!("Giving up on {} after {} consecutive faults", self.transport.name(), faults);
                self.state.mark_closed();
                cancel.cancel();
                self.transport.close();
                break;
            }
        }

        info!("IO loop stopped");
        self.transport
    }

    fn write_request(&mut self, request: &str) -> Result<(), ProtocolError> {
        debug!("INPUT -> {}", request);
        self.transport.write_bytes(&encode_command(request))?;
        Ok(())
    }

    fn poll_inbound(&mut self) -> Result<(), ProtocolError> {
        let Some(bytes) = self.transport.read_available()? else {
            return Ok(());
        };

        let frame = make_visible(&bytes);
        debug!("OUTPUT <- {}", frame);
        if let Some(first) = self.first_frame.take() {
            let _ = first.send(frame.clone());
        }
        if self.responses.send(frame).is_err() {
            debug!("Response queue closed, dropping frame");
        }
        Ok(())
    }
}
