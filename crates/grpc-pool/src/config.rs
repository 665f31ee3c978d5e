use crate::{Error, Result};
use core::time::Duration;

/// Minimum interval between two reaper passes.
pub const MIN_CHECK_PERIOD: Duration = Duration::from_secs(3);

/// Idle duration applied when the configured close-wait is below one second.
pub const DEFAULT_CLOSE_WAIT: Duration = Duration::from_secs(20);

/// Smallest accepted scale-up divisor.
pub const MIN_NEW_CONN_RATE: i32 = 2;

/// Default period of the debug state dump.
pub const DEFAULT_DESCRIBE_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-dial deadline.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound on how long [`Pool::close`] waits for references to
/// drain.
///
/// [`Pool::close`]: crate::Pool::close
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default polling interval while waiting for references to drain.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Runtime configuration of a [`Pool`](crate::Pool).
///
/// All values are fixed once the pool is constructed. Unset or out-of-range
/// values are replaced by [`PoolConfig::normalize`], which the pool applies
/// during construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Endpoint every connection dials, e.g. `http://127.0.0.1:50051`.
    pub target: String,
    /// Hard cap on live connections. Also the size of the ready queue.
    pub max_conns: i32,
    /// Number of idle connections the reaper retains.
    pub max_idle_conns: i32,
    /// Maximum concurrent users of a single connection.
    pub max_refs: i32,
    /// Scale-up divisor. A new connection is dialed once the pool-wide
    /// reference count reaches `max_refs * open / new_conn_rate`.
    pub new_conn_rate: i32,
    /// Interval between reaper passes.
    pub check_period: Duration,
    /// Minimum idle duration before a connection may be closed.
    pub close_wait: Duration,
    /// Deadline applied to every dial.
    pub dial_timeout: Duration,
    /// Wait for the transport handshake when dialing instead of connecting
    /// lazily on first use.
    pub dial_block: bool,
    /// Periodically log a [`Pool::describe`](crate::Pool::describe) snapshot.
    pub debug: bool,
    /// Period of the debug snapshot.
    pub describe_interval: Duration,
    /// Upper bound on how long shutdown waits for references to drain.
    pub shutdown_timeout: Duration,
    /// Polling interval while waiting for references to drain.
    pub drain_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            max_conns: 30,
            max_idle_conns: 10,
            max_refs: 10,
            new_conn_rate: MIN_NEW_CONN_RATE,
            check_period: Duration::from_secs(10),
            close_wait: DEFAULT_CLOSE_WAIT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dial_block: false,
            debug: false,
            describe_interval: DEFAULT_DESCRIBE_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration for `target` with every other option at its
    /// default.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Applies floors and defaults to every option.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetNotAvailable`] if `target` is empty.
    pub fn normalize(mut self) -> Result<Self> {
        if self.target.trim().is_empty() {
            return Err(Error::TargetNotAvailable);
        }

        self.max_conns = self.max_conns.max(1);
        self.max_idle_conns = self.max_idle_conns.clamp(1, self.max_conns);
        self.max_refs = self.max_refs.max(1);
        self.new_conn_rate = self.new_conn_rate.max(MIN_NEW_CONN_RATE);

        if self.check_period < MIN_CHECK_PERIOD {
            self.check_period = MIN_CHECK_PERIOD;
        }
        if self.close_wait < Duration::from_secs(1) {
            self.close_wait = DEFAULT_CLOSE_WAIT;
        }
        if self.describe_interval.is_zero() {
            self.describe_interval = DEFAULT_DESCRIBE_INTERVAL;
        }
        if self.dial_timeout.is_zero() {
            self.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if self.shutdown_timeout.is_zero() {
            self.shutdown_timeout = DEFAULT_SHUTDOWN_TIMEOUT;
        }
        if self.drain_interval.is_zero() {
            self.drain_interval = DEFAULT_DRAIN_INTERVAL;
        }

        Ok(self)
    }
}
