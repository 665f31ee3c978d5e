//! The connection pool.
//!
//! This module defines [`Pool`], which owns a bounded set of [`Connection`]s
//! to one target and hands them out to concurrent callers. Each connection is
//! shared by up to `max_refs` callers at a time.
//!
//! ## Scheduling
//!
//! Connections advertise themselves: every live connection has a monitor task
//! that pushes it onto a bounded ready queue whenever it has spare capacity.
//! [`Pool::acquire`] simply waits on that queue, so picking a connection never
//! scans the connection set.
//!
//! ## Scaling
//!
//! - **Up**: each acquisition first counts itself against the pool-wide
//!   reference total. Once the total reaches `max_refs * open / new_conn_rate`
//!   a quota ticket is taken and a new connection is dialed in the background.
//! - **Down**: the reaper periodically marks surplus idle connections as
//!   closing and removes closing connections once their references drain.
//!
//! ## Shutdown
//!
//! [`Pool::close`] marks every connection closing, closes the ready queue,
//! waits (bounded) for outstanding references, and then releases every handle.

mod counters;
mod describe;
mod guard;
mod reaper;
#[cfg(test)]
mod tests;

pub use counters::PoolStats;
pub use guard::PooledConnection;

use crate::{
    ConnQuota, Dialer, Error, PoolConfig, Result,
    connection::{Connection, monitor_loop},
};
use async_channel::{Receiver, Sender};
use core::{fmt, time::Duration};
use counters::PoolCounters;
use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for a cancelled background task to finish.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

type ConnRef<D> = Arc<Connection<<D as Dialer>::Handle>>;

/// Outcome of [`Pool::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// Every reference was released before the handles were closed.
    Drained,
    /// The shutdown deadline passed with references still held. Their handles
    /// were closed anyway.
    TimedOut { outstanding: i32 },
}

/// A client-side pool of multiplexed connections to a single target.
///
/// `Pool` is a cheap handle; clones share the same connections.
pub struct Pool<D: Dialer> {
    inner: Arc<PoolInner<D>>,
}

pub(crate) struct PoolInner<D: Dialer> {
    config: PoolConfig,
    dialer: D,
    conns: RwLock<Vec<ConnRef<D>>>,
    quota: ConnQuota,
    counters: PoolCounters,
    ready_tx: Sender<ConnRef<D>>,
    ready_rx: Receiver<ConnRef<D>>,
    next_id: AtomicUsize,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    // Reaper first, then the describer if enabled.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Dialer> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.inner.config.target)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<D: Dialer> Pool<D> {
    /// Creates an empty pool. Call [`Pool::run`] to open the initial
    /// connections and start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotAvailable`] if the configured target is
    /// empty.
    pub fn new(config: PoolConfig, dialer: D) -> Result<Self> {
        let config = config.normalize()?;
        let (ready_tx, ready_rx) = async_channel::bounded(config.max_conns as usize);

        Ok(Self {
            inner: Arc::new(PoolInner {
                quota: ConnQuota::new(config.max_conns),
                counters: PoolCounters::new(config.max_conns),
                conns: RwLock::new(Vec::with_capacity(config.max_conns as usize)),
                ready_tx,
                ready_rx,
                next_id: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::with_capacity(2)),
                config,
                dialer,
            }),
        })
    }

    /// Opens up to `max_idle_conns` connections and starts the reaper (and
    /// the describer when `debug` is set). Subsequent calls do nothing.
    ///
    /// Dial failures are logged and skipped; the pool grows on demand later.
    pub async fn run(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        for _ in 0..self.inner.config.max_idle_conns {
            if !self.inner.quota.try_acquire() {
                break;
            }
            // Failures already returned the ticket and were logged.
            let _ = self.create_conn().await;
        }

        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(reaper::reaper_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.check_period,
            self.inner.shutdown.clone(),
        )));

        #[cfg(feature = "tracing")]
        if self.inner.config.debug {
            tasks.push(tokio::spawn(describe::describe_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.describe_interval,
                self.inner.shutdown.clone(),
            )));
        }
    }

    /// Waits up to `wait` for a connection with spare capacity.
    ///
    /// The returned guard releases the reference when dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::WaitReadyTimeout`] if nothing became ready in time.
    /// - [`Error::PoolClosed`] if the pool is shut down.
    pub async fn acquire(&self, wait: Duration) -> Result<PooledConnection<D>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        // Count the caller before looking for a connection so concurrent
        // arrivals all see each other's demand in the growth check.
        let refs = self.inner.counters.add_ref();
        self.maybe_grow(refs);

        // `timeout` saturates oversized durations, so `Duration::MAX` waits
        // indefinitely.
        let waited = timeout(wait, async {
            loop {
                let conn = match self.inner.ready_rx.recv().await {
                    Ok(conn) => conn,
                    Err(_) => return Err(Error::PoolClosed),
                };
                if let Some(guard) = self.take_ref(conn) {
                    return Ok(guard);
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(guard)) => Ok(guard),
            Ok(Err(e)) => {
                self.inner.counters.sub_ref();
                Err(e)
            }
            Err(_) => {
                self.inner.counters.sub_ref();
                Err(Error::WaitReadyTimeout { waited: wait })
            }
        }
    }

    /// Takes a connection only if one is ready right now.
    ///
    /// Called outside a tokio runtime it still hands out ready connections,
    /// but never dials a new one.
    ///
    /// # Errors
    ///
    /// - [`Error::NoConnectionAvailable`] if the ready queue is empty.
    /// - [`Error::PoolClosed`] if the pool is shut down.
    pub fn try_acquire(&self) -> Result<PooledConnection<D>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let refs = self.inner.counters.add_ref();
        self.maybe_grow(refs);

        while let Ok(conn) = self.inner.ready_rx.try_recv() {
            if let Some(guard) = self.take_ref(conn) {
                return Ok(guard);
            }
        }

        self.inner.counters.sub_ref();
        Err(Error::NoConnectionAvailable)
    }

    /// Returns one reference to `conn`.
    ///
    /// Prefer dropping the [`PooledConnection`] guard, which calls this
    /// exactly once. Releasing a connection that holds no reference is
    /// ignored.
    pub fn release(&self, conn: &Connection<D::Handle>) {
        match conn.release() {
            Some(0) => {
                self.inner.counters.sub_ref();
                if !conn.is_closing() {
                    self.inner.counters.add_idle();
                }
            }
            Some(_) => {
                self.inner.counters.sub_ref();
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(conn = conn.id(), "Ignoring release of unreferenced connection");
            }
        }
    }

    /// Gracefully shuts the pool down.
    ///
    /// Waits up to `shutdown_timeout` for outstanding references to be
    /// released, then closes every handle regardless. Calling it again returns
    /// [`ShutdownStatus::Drained`] immediately.
    pub async fn close(&self) -> ShutdownStatus {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return ShutdownStatus::Drained;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(target = self.inner.dialer.target(), "Closing connection pool");

        {
            let conns = self.inner.conns.write();
            for conn in conns.iter() {
                conn.set_closing(true);
            }
            self.inner.ready_tx.close();
        }
        self.inner.shutdown.cancel();
        self.join_background_tasks().await;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Draining outstanding references ({} held)",
            self.inner.counters.refs()
        );
        let drain_interval = self.inner.config.drain_interval;
        let drained = timeout(self.inner.config.shutdown_timeout, async {
            while self.inner.counters.refs() > 0 {
                sleep(drain_interval).await;
            }
        })
        .await;

        let status = match drained {
            Ok(()) => ShutdownStatus::Drained,
            Err(_) => {
                let outstanding = self.inner.counters.refs();
                #[cfg(feature = "tracing")]
                tracing::warn!("Pool drain timed out ({outstanding} references still held)");
                ShutdownStatus::TimedOut { outstanding }
            }
        };

        {
            let mut conns = self.inner.conns.write();
            for conn in conns.drain(..) {
                conn.close();
            }
        }
        self.inner.counters.reset();
        self.inner.quota.reset();

        #[cfg(feature = "tracing")]
        tracing::info!("Connection pool closed");

        status
    }

    /// Current counter snapshot. Eventually consistent between reaper passes.
    pub fn stats(&self) -> PoolStats {
        self.inner.counters.snapshot()
    }

    /// Number of connections currently held in the pool, including those
    /// draining.
    pub fn connection_count(&self) -> usize {
        self.inner.conns.read().len()
    }

    /// Normalized configuration in effect.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Waits for the reaper and describer to observe the cancelled token.
    async fn join_background_tasks(&self) {
        let tasks = core::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!("Background task did not stop within {TASK_JOIN_TIMEOUT:?}");
            }
        }
    }

    /// Starts a background dial if demand crossed the growth threshold and a
    /// quota ticket is available.
    fn maybe_grow(&self, refs: i32) {
        if !self.growth_needed(refs) {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            #[cfg(feature = "tracing")]
            tracing::debug!("No tokio runtime, skipping pool growth");
            return;
        };
        if !self.inner.quota.try_acquire() {
            return;
        }

        let pool = self.clone();
        runtime.spawn(async move {
            let _ = pool.create_conn().await;
        });
    }

    fn growth_needed(&self, refs: i32) -> bool {
        let config = &self.inner.config;
        let counters = &self.inner.counters;
        let open = i64::from((counters.active() - counters.closing()).max(0));
        let threshold = i64::from(config.max_refs) * open / i64::from(config.new_conn_rate);
        i64::from(refs) >= threshold
    }

    /// Converts a popped connection into a guard, or returns `None` if the
    /// connection refused the reference.
    fn take_ref(&self, conn: ConnRef<D>) -> Option<PooledConnection<D>> {
        match conn.acquire() {
            Ok(refs) => {
                // First user of an idle connection.
                if refs == 1 {
                    self.inner.counters.sub_idle();
                }
                Some(PooledConnection::new(self.clone(), conn))
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(conn = conn.id(), "Skipping ready connection: {_e}");
                None
            }
        }
    }

    /// Dials and registers one connection. The caller must hold a quota
    /// ticket; it is returned if the connection is not registered.
    async fn create_conn(&self) -> Result<ConnRef<D>> {
        let config = &self.inner.config;
        let _started = Instant::now();

        let dialed = match timeout(config.dial_timeout, self.inner.dialer.dial(config.dial_block))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::DialTimeout {
                target: self.inner.dialer.target().to_string(),
                timeout: config.dial_timeout,
            }),
        };

        #[cfg(feature = "tracing")]
        if config.debug {
            tracing::debug!("Dial cost {:?}", _started.elapsed());
        }

        let handle = match dialed {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.quota.release();
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to open connection: {e}");
                return Err(e);
            }
        };

        let conn = {
            let mut conns = self.inner.conns.write();
            if self.is_closed() {
                drop(conns);
                self.inner.quota.release();
                return Err(Error::PoolClosed);
            }

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let conn = Arc::new(Connection::new(
                id,
                handle,
                config.max_refs,
                config.close_wait,
            ));
            conns.push(Arc::clone(&conn));
            self.inner.counters.add_active();
            self.inner.counters.add_idle();
            conn
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(conn = conn.id(), "Opened connection");

        tokio::spawn(monitor_loop(
            Arc::clone(&conn),
            self.inner.ready_tx.clone(),
            self.inner.shutdown.clone(),
        ));

        Ok(conn)
    }
}

impl Pool<crate::TonicDialer> {
    /// Creates a pool of [`tonic`] channels to `config.target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotAvailable`] or [`Error::InvalidConfig`] if
    /// the target cannot be used.
    pub fn from_config(config: PoolConfig) -> Result<Self> {
        let config = config.normalize()?;
        let dialer = crate::TonicDialer::new(&config.target, config.dial_timeout)?;
        Self::new(config, dialer)
    }
}
