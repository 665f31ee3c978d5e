//! Periodic eviction of idle and drained connections.

use super::{Pool, PoolInner};
use crate::Dialer;
use core::time::Duration;
use std::sync::Weak;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// What a single reaper pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReapReport {
    /// Connections closed and dropped from the pool.
    pub removed: usize,
    /// Idle connections newly marked closing.
    pub marked: usize,
}

impl<D: Dialer> Pool<D> {
    /// Runs one reaper pass under the exclusive lock.
    ///
    /// 1. Closes and drops every closing connection with no references, and
    ///    returns its quota ticket.
    /// 2. Marks surplus idle connections (beyond `max_idle_conns`) closing, in
    ///    pool order. A connection idle for less than `close_wait` is skipped.
    /// 3. Overwrites the active/idle/closing counters with the exact values.
    pub(crate) fn reap(&self) -> ReapReport {
        let inner = &self.inner;
        let mut report = ReapReport::default();
        let mut conns = inner.conns.write();

        conns.retain(|conn| {
            if conn.remove_able() {
                conn.close();
                inner.quota.release();
                report.removed += 1;
                false
            } else {
                true
            }
        });

        let mut idle = 0;
        let mut closing = 0;
        for conn in conns.iter() {
            if conn.is_closing() {
                closing += 1;
            } else if conn.ref_count() == 0 {
                idle += 1;
            }
        }

        let mut surplus = idle - inner.config.max_idle_conns;
        for conn in conns.iter() {
            if surplus <= 0 {
                break;
            }
            if conn.is_closing() || conn.ref_count() > 0 {
                continue;
            }
            if conn.set_closing(false) {
                closing += 1;
                idle -= 1;
                surplus -= 1;
                report.marked += 1;
            }
        }

        inner
            .counters
            .reconcile(conns.len() as i32, idle, closing);

        #[cfg(feature = "tracing")]
        if report != ReapReport::default() {
            tracing::debug!(
                removed = report.removed,
                marked = report.marked,
                active = conns.len(),
                idle,
                closing,
                "Reaped connections"
            );
        }

        report
    }
}

/// Runs [`Pool::reap`] every `period` until `shutdown` is cancelled or the
/// pool is dropped.
pub(crate) async fn reaper_loop<D: Dialer>(
    pool: Weak<PoolInner<D>>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = pool.upgrade() else {
            break;
        };
        Pool { inner }.reap();
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Reaper stopped");
}
