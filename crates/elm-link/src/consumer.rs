//! Response consumer
//!
//! Placeholder for routing replies to the queries that asked for them. For
//! now it surfaces the first frame read after connecting and exits.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Wait for the first response frame and log it
pub(crate) async fn consume_first(
    first_frame: oneshot::Receiver<String>,
    cancel: CancellationToken,
) -> Option<String> {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Consumer cancelled before any response");
            None
        }
        frame = first_frame => match frame {
            Ok(frame) => {
                info!("OUTPUT <- {}", frame);
                Some(frame)
            }
            Err(_) => None,
        },
    }
}
