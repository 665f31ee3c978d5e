use super::Pool;
use crate::Dialer;

impl<D: Dialer> Pool<D> {
    /// Human-readable snapshot of the counters and every connection.
    ///
    /// Diagnostic only: counters are read without the lock and may be
    /// momentarily inconsistent with the connection list.
    pub fn describe(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "Pool{{active: {}, refs: {}, idle: {}, closing: {}, quota: {}}}\nConns:",
            stats.active,
            stats.refs,
            stats.idle,
            stats.closing,
            self.inner.quota.available(),
        );

        for conn in self.inner.conns.read().iter() {
            out.push('\n');
            out.push_str(&conn.to_string());
        }
        out
    }
}

/// Logs [`Pool::describe`] every `period` until `shutdown` is cancelled or the
/// pool is dropped.
#[cfg(feature = "tracing")]
pub(crate) async fn describe_loop<D: Dialer>(
    pool: std::sync::Weak<super::PoolInner<D>>,
    period: core::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = pool.upgrade() else {
            break;
        };
        tracing::info!("{}", Pool { inner }.describe());
    }
}
