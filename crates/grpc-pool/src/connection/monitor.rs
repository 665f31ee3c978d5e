use super::Connection;
use async_channel::{Sender, TrySendError};
use core::time::Duration;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Backoff between two checks while the connection is saturated, already
/// queued, or the queue is full.
pub(crate) const MONITOR_BACKOFF: Duration = Duration::from_millis(1);

/// Background task that republishes a connection to the ready queue whenever
/// it has spare capacity.
///
/// The loop runs for the connection's whole lifetime and only ends when:
/// - the connection is marked closing,
/// - the ready queue is closed, or
/// - the pool's `shutdown` token is cancelled.
///
/// Publishing always uses a non-blocking send so a full or closed queue can
/// never stall shutdown. The readying flag is claimed before the send so a
/// consumer that pops the connection immediately still clears it afterwards.
pub(crate) async fn monitor_loop<H>(
    conn: Arc<Connection<H>>,
    ready: Sender<Arc<Connection<H>>>,
    shutdown: CancellationToken,
) where
    H: Send + Sync + 'static,
{
    #[cfg(feature = "tracing")]
    tracing::trace!(conn = conn.id(), "Monitor started");

    while !conn.is_closing() {
        if !conn.is_saturated() && conn.mark_readying() {
            match ready.try_send(Arc::clone(&conn)) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => conn.unmark_readying(),
                Err(TrySendError::Closed(_)) => {
                    conn.unmark_readying();
                    break;
                }
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(MONITOR_BACKOFF) => {}
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(conn = conn.id(), "Monitor stopped");
}
