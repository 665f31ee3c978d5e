use super::*;
use core::time::Duration;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct MockState {
    dials: AtomicUsize,
    fail: AtomicBool,
}

/// Dials instantly, handing out the dial number as the handle.
#[derive(Clone, Default)]
struct MockDialer {
    state: Arc<MockState>,
}

impl MockDialer {
    fn dials(&self) -> usize {
        self.state.dials.load(Ordering::Acquire)
    }

    fn set_failing(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::Release);
    }
}

impl Dialer for MockDialer {
    type Handle = usize;

    async fn dial(&self, _block: bool) -> Result<usize> {
        if self.state.fail.load(Ordering::Acquire) {
            return Err(Error::Dial {
                target: self.target().to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(self.state.dials.fetch_add(1, Ordering::AcqRel))
    }

    fn target(&self) -> &str {
        "mock://pool"
    }
}

fn config(max_conns: i32, max_idle_conns: i32, max_refs: i32) -> PoolConfig {
    PoolConfig {
        max_conns,
        max_idle_conns,
        max_refs,
        close_wait: Duration::from_secs(1),
        shutdown_timeout: Duration::from_millis(200),
        drain_interval: Duration::from_millis(10),
        ..PoolConfig::new("mock://pool")
    }
}

async fn start(config: PoolConfig) -> (Pool<MockDialer>, MockDialer) {
    let dialer = MockDialer::default();
    let pool = Pool::new(config, dialer.clone()).unwrap();
    pool.run().await;
    (pool, dialer)
}

#[test]
fn new_rejects_empty_target() {
    let err = Pool::new(PoolConfig::default(), MockDialer::default()).unwrap_err();
    assert_eq!(err, Error::TargetNotAvailable);
}

#[tokio::test]
async fn run_fills_to_max_idle() {
    let (pool, dialer) = start(config(5, 2, 4)).await;

    assert_eq!(dialer.dials(), 2);
    assert_eq!(pool.connection_count(), 2);
    assert_eq!(
        pool.stats(),
        PoolStats {
            active: 2,
            idle: 2,
            closing: 0,
            refs: 0
        }
    );
    assert_eq!(pool.inner.quota.available(), 3);

    // A second run is a no-op.
    pool.run().await;
    assert_eq!(dialer.dials(), 2);
}

#[tokio::test]
async fn failed_dials_return_quota() {
    let dialer = MockDialer::default();
    dialer.set_failing(true);
    let pool = Pool::new(config(3, 2, 1), dialer.clone()).unwrap();
    pool.run().await;

    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.inner.quota.available(), 3);

    // Once the target recovers, demand grows the pool again.
    dialer.set_failing(false);
    let conn = pool.acquire(WAIT).await.unwrap();
    assert_eq!(conn.ref_count(), 1);
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test]
async fn acquire_release_round_trip_restores_idle_count() {
    let (pool, _) = start(config(1, 1, 4)).await;
    let before = pool.stats();

    let first = pool.acquire(WAIT).await.unwrap();
    let second = pool.acquire(WAIT).await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.ref_count(), 2);
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(pool.stats().refs, 2);

    drop(first);
    assert_eq!(pool.stats().idle, 0);
    second.release();

    assert_eq!(pool.stats(), before);
}

#[tokio::test]
async fn double_release_is_ignored() {
    let (pool, _) = start(config(1, 1, 2)).await;

    let conn = pool.acquire(WAIT).await.unwrap().detach();
    assert_eq!(pool.stats().idle, 0);

    pool.release(&conn);
    pool.release(&conn);

    assert_eq!(conn.ref_count(), 0);
    assert_eq!(pool.stats().idle, 1);
    assert_eq!(pool.stats().refs, 0);
}

#[tokio::test]
async fn acquire_with_unbounded_wait() {
    let (pool, _) = start(config(1, 1, 1)).await;

    let conn = pool.acquire(Duration::MAX).await.unwrap();
    assert_eq!(conn.ref_count(), 1);
    assert_eq!(pool.stats().refs, 1);
}

#[tokio::test]
async fn concurrent_holders_share_one_connection() {
    // A single ticket rules out growth, so both callers must multiplex.
    let (pool, dialer) = start(config(1, 1, 2)).await;

    let (a, b) = tokio::try_join!(pool.acquire(WAIT), pool.acquire(WAIT)).unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(a.ref_count(), 2);
    assert!(a.is_saturated());
    assert_eq!(dialer.dials(), 1);

    let err = pool.acquire(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, Error::WaitReadyTimeout { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holders_share_then_grow() {
    let (pool, dialer) = start(config(3, 1, 2)).await;
    assert_eq!(pool.connection_count(), 1);

    // With one open connection the growth threshold is
    // `max_refs * 1 / new_conn_rate = 1`, so the very first caller already
    // starts a dial and the holders usually spread over connections. Only the
    // cap and the connection bound are deterministic here.
    let guards = futures::future::try_join_all((0..3).map(|_| pool.acquire(WAIT)))
        .await
        .unwrap();

    let ids: HashSet<usize> = guards.iter().map(|g| g.id()).collect();
    assert!(ids.len() >= 2, "three holders cannot fit on one connection");
    for guard in &guards {
        assert!(guard.ref_count() <= 2);
    }
    assert!(pool.connection_count() >= 2);
    assert!(dialer.dials() <= 3);
}

#[tokio::test]
async fn acquire_times_out_when_saturated() {
    let (pool, dialer) = start(config(1, 1, 1)).await;
    let _held = pool.acquire(WAIT).await.unwrap();

    let started = Instant::now();
    let err = pool.acquire(Duration::from_millis(10)).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        err,
        Error::WaitReadyTimeout {
            waited: Duration::from_millis(10)
        }
    );
    assert!(elapsed >= Duration::from_millis(10));
    assert!(elapsed < Duration::from_millis(500));

    // The speculative reference was rolled back and no dial was attempted.
    assert_eq!(pool.stats().refs, 1);
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn try_acquire_does_not_wait() {
    let (pool, _) = start(config(1, 1, 1)).await;
    let held = pool.acquire(WAIT).await.unwrap();

    assert_eq!(pool.try_acquire().unwrap_err(), Error::NoConnectionAvailable);
    assert_eq!(pool.stats().refs, 1);

    drop(held);
    let conn = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(conn) = pool.try_acquire() {
                break conn;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(conn.ref_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bursts_never_exceed_max_conns() {
    let (pool, dialer) = start(config(3, 1, 1)).await;

    let tasks = (0..50).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire(Duration::from_secs(5)).await?;
            assert_eq!(conn.ref_count(), 1);
            tokio::time::sleep(Duration::from_millis(2)).await;
            let count = pool.connection_count();
            drop(conn);
            Ok::<usize, Error>(count)
        })
    });

    for result in futures::future::join_all(tasks).await {
        assert!(result.unwrap().unwrap() <= 3);
    }
    assert!(dialer.dials() <= 3);
    assert!(pool.connection_count() <= 3);
    assert_eq!(pool.stats().refs, 0);
}

#[tokio::test(start_paused = true)]
async fn reaper_closes_surplus_idle_connections() {
    let (pool, _) = start(config(2, 1, 1)).await;

    // Two single-reference holders force a second connection.
    let a = pool.acquire(WAIT).await.unwrap();
    let b = pool.acquire(WAIT).await.unwrap();
    assert_ne!(a.id(), b.id());
    drop(a);
    drop(b);
    assert_eq!(pool.connection_count(), 2);

    // Idle for less than close-wait: surplus is kept.
    assert_eq!(pool.reap().marked, 0);
    assert_eq!(pool.stats().idle, 2);

    tokio::time::advance(Duration::from_secs(2)).await;

    let report = pool.reap();
    assert_eq!(report.marked, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(
        pool.stats(),
        PoolStats {
            active: 2,
            idle: 1,
            closing: 1,
            refs: 0
        }
    );
    let closing: Vec<usize> = pool
        .inner
        .conns
        .read()
        .iter()
        .filter(|c| c.is_closing())
        .map(|c| c.id())
        .collect();

    let report = pool.reap();
    assert_eq!(report.removed, 1);
    assert_eq!(pool.connection_count(), 1);
    assert_eq!(pool.inner.quota.available(), 1);
    assert_eq!(pool.stats().closing, 0);

    // The idle target is never undercut.
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(pool.reap(), reaper::ReapReport::default());
    assert_eq!(pool.connection_count(), 1);

    // A closed connection is never handed out again.
    for _ in 0..3 {
        let conn = pool.acquire(WAIT).await.unwrap();
        assert!(!closing.contains(&conn.id()));
        assert!(!conn.is_closing());
    }
}

#[tokio::test(start_paused = true)]
async fn background_reaper_shrinks_to_idle_target_until_closed() {
    let (pool, _) = start(PoolConfig {
        check_period: Duration::from_secs(3),
        ..config(2, 1, 1)
    })
    .await;

    let a = pool.acquire(WAIT).await.unwrap();
    let b = pool.acquire(WAIT).await.unwrap();
    drop(a);
    drop(b);
    assert_eq!(pool.connection_count(), 2);

    // One pass marks the surplus connection, the next removes it.
    tokio::time::sleep(Duration::from_secs(1) + 2 * Duration::from_secs(3) + WAIT).await;
    assert_eq!(pool.connection_count(), 1);
    assert_eq!(
        pool.stats(),
        PoolStats {
            active: 1,
            idle: 1,
            closing: 0,
            refs: 0
        }
    );
    assert_eq!(pool.inner.quota.available(), 1);

    let reaper = pool.inner.tasks.lock()[0].abort_handle();
    assert!(!reaper.is_finished());

    assert_eq!(pool.close().await, ShutdownStatus::Drained);
    assert!(reaper.is_finished());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.stats(), PoolStats::default());
}

#[test]
fn try_acquire_outside_runtime_does_not_grow() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (pool, dialer) = rt.block_on(start(config(2, 1, 1)));
    // Let the monitor publish the initial connection.
    rt.block_on(async { tokio::time::sleep(Duration::from_millis(10)).await });

    let conn = pool.try_acquire().unwrap();
    assert_eq!(conn.ref_count(), 1);
    assert_eq!(dialer.dials(), 1);
    assert_eq!(pool.inner.quota.available(), 1);

    assert_eq!(pool.try_acquire().unwrap_err(), Error::NoConnectionAvailable);
    assert_eq!(pool.stats().refs, 1);
}

#[tokio::test(start_paused = true)]
async fn reaper_keeps_referenced_connections() {
    let (pool, _) = start(config(2, 1, 1)).await;
    let a = pool.acquire(WAIT).await.unwrap();
    let b = pool.acquire(WAIT).await.unwrap();
    drop(b);

    tokio::time::advance(Duration::from_secs(5)).await;
    pool.reap();

    assert!(!a.is_closing());
    assert_eq!(pool.stats().idle, 1);
    assert_eq!(pool.stats().closing, 0);
}

#[tokio::test]
async fn close_with_idle_connections_drains_immediately() {
    let (pool, _) = start(config(4, 2, 2)).await;

    let started = Instant::now();
    assert_eq!(pool.close().await, ShutdownStatus::Drained);
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.stats(), PoolStats::default());
    assert_eq!(pool.acquire(WAIT).await.unwrap_err(), Error::PoolClosed);
    assert_eq!(pool.close().await, ShutdownStatus::Drained);
}

#[tokio::test]
async fn close_waits_for_outstanding_references() {
    let (pool, _) = start(config(2, 1, 2)).await;
    let held = pool.acquire(WAIT).await.unwrap();

    let closer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.close().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!closer.is_finished());
    assert_eq!(held.handle(), Ok(0));

    drop(held);
    assert_eq!(closer.await.unwrap(), ShutdownStatus::Drained);
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn close_times_out_and_closes_anyway() {
    let (pool, _) = start(config(2, 1, 2)).await;
    let held = pool.acquire(WAIT).await.unwrap();

    assert_eq!(
        pool.close().await,
        ShutdownStatus::TimedOut { outstanding: 1 }
    );
    assert_eq!(held.handle(), Err(Error::ConnectionClosed));
    assert_eq!(pool.stats(), PoolStats::default());

    // Releasing after shutdown must not corrupt the reset counters.
    drop(held);
    assert_eq!(pool.stats(), PoolStats::default());
}

#[tokio::test]
async fn waiting_callers_fail_when_pool_closes() {
    let (pool, _) = start(config(1, 1, 1)).await;
    let held = pool.acquire(WAIT).await.unwrap().detach();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let closer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.close().await })
    };
    assert_eq!(waiter.await.unwrap(), Err(Error::PoolClosed));

    pool.release(&held);
    assert_eq!(closer.await.unwrap(), ShutdownStatus::Drained);
}

#[tokio::test]
async fn describe_lists_every_connection() {
    let (pool, _) = start(config(3, 2, 5)).await;
    let _conn = pool.acquire(WAIT).await.unwrap();

    let text = pool.describe();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("Pool{active: 2, refs: 1"));
    assert_eq!(lines.next(), Some("Conns:"));
    assert_eq!(lines.filter(|l| l.starts_with("Conn#")).count(), 2);
}
