//! A single pooled connection and its lifecycle.
//!
//! A [`Connection`] wraps one transport handle and tracks how many callers are
//! currently multiplexed over it. Every field that the hot path touches is an
//! atomic so acquiring and releasing never takes a lock.
//!
//! ## Lifecycle
//!
//! - **Fresh**: just dialed, no references.
//! - **Readying**: sitting in the pool's ready queue, unused.
//! - **In use**: one or more references held.
//! - **Idle**: no references, waiting to be re-queued or reaped.
//! - **Closing**: no new references are granted; existing ones drain.
//! - **Closed**: the handle has been released.
//!
//! The transition back to *Readying* is driven by [`monitor_loop`], one task
//! per connection.

mod monitor;

pub(crate) use monitor::monitor_loop;

use crate::{Error, Result};
use core::{fmt, time::Duration};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use tokio::time::Instant;

/// A reference-counted transport connection owned by a [`Pool`].
///
/// Callers never construct connections directly; they receive them through
/// [`Pool::acquire`] wrapped in a [`PooledConnection`] guard.
///
/// [`Pool`]: crate::Pool
/// [`Pool::acquire`]: crate::Pool::acquire
/// [`PooledConnection`]: crate::PooledConnection
pub struct Connection<H> {
    id: usize,
    handle: Mutex<Option<H>>,
    ref_count: AtomicI32,
    ref_max: i32,
    closing: AtomicBool,
    readying: AtomicBool,
    born: Instant,
    // Milliseconds since `born` of the last acquisition or release to zero.
    last_referred: AtomicU64,
    close_wait: Duration,
}

impl<H> Connection<H> {
    pub(crate) fn new(id: usize, handle: H, ref_max: i32, close_wait: Duration) -> Self {
        Self {
            id,
            handle: Mutex::new(Some(handle)),
            ref_count: AtomicI32::new(0),
            ref_max,
            closing: AtomicBool::new(false),
            readying: AtomicBool::new(false),
            born: Instant::now(),
            last_referred: AtomicU64::new(0),
            close_wait,
        }
    }

    /// Pool-unique identifier, used in logs and [`Pool::describe`].
    ///
    /// [`Pool::describe`]: crate::Pool::describe
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Returns a clone of the underlying transport handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the handle has been released.
    pub fn handle(&self) -> Result<H>
    where
        H: Clone,
    {
        self.handle.lock().clone().ok_or(Error::ConnectionClosed)
    }

    /// Current number of references, never negative.
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire).max(0)
    }

    /// Maximum number of concurrent references.
    pub const fn ref_max(&self) -> i32 {
        self.ref_max
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// `true` while the connection sits unused in the ready queue.
    pub fn is_readying(&self) -> bool {
        self.readying.load(Ordering::Acquire)
    }

    /// `true` once the reference cap has been reached.
    pub fn is_saturated(&self) -> bool {
        self.ref_count() >= self.ref_max
    }

    /// How long the connection has gone without being referred to. Zero while
    /// any reference is held.
    pub fn idle_for(&self) -> Duration {
        if self.ref_count() > 0 {
            return Duration::ZERO;
        }
        let last = Duration::from_millis(self.last_referred.load(Ordering::Acquire));
        self.born.elapsed().saturating_sub(last)
    }

    /// Takes one reference.
    ///
    /// Also clears the readying flag, since the only caller is the pool after
    /// popping the connection off the ready queue.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosing`] if the connection is draining.
    /// - [`Error::TooManyReferences`] if the reference cap is reached.
    ///
    /// The reference count is left untouched on error.
    pub(crate) fn acquire(&self) -> Result<i32> {
        self.readying.store(false, Ordering::Release);

        if self.is_closing() {
            return Err(Error::ConnectionClosing);
        }

        let refs = self.ref_count.fetch_add(1, Ordering::AcqRel) + 1;

        // `set_closing` may have won the race after the first check.
        if self.is_closing() {
            self.ref_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ConnectionClosing);
        }
        if refs > self.ref_max {
            self.ref_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::TooManyReferences { max: self.ref_max });
        }

        self.touch();
        Ok(refs)
    }

    /// Drops one reference and returns the remaining count.
    ///
    /// Returns `None` if there was no reference to drop, which only happens on
    /// a double release. The counter is restored in that case.
    pub(crate) fn release(&self) -> Option<i32> {
        let refs = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if refs < 0 {
            self.ref_count.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        if refs == 0 {
            self.touch();
        }
        Some(refs)
    }

    /// Marks the connection closing. Irreversible.
    ///
    /// Unless `force` is set this only succeeds for an unreferenced connection
    /// that has been idle for at least the configured close-wait.
    pub(crate) fn set_closing(&self, force: bool) -> bool {
        if self.is_closing() {
            return true;
        }
        if !force && (self.ref_count() > 0 || self.idle_for() < self.close_wait) {
            return false;
        }
        self.closing.store(true, Ordering::Release);
        true
    }

    /// `true` once the connection is closing and every reference has drained.
    pub(crate) fn remove_able(&self) -> bool {
        self.is_closing() && self.ref_count() <= 0
    }

    /// Releases the transport handle. Calling it again is a no-op.
    pub(crate) fn close(&self) {
        if let Some(handle) = self.handle.lock().take() {
            drop(handle);
            #[cfg(feature = "tracing")]
            tracing::trace!(conn = self.id, "Connection handle released");
        }
    }

    /// Claims the readying flag. Returns `false` if it was already set.
    pub(crate) fn mark_readying(&self) -> bool {
        self.readying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unmark_readying(&self) {
        self.readying.store(false, Ordering::Release);
    }

    fn touch(&self) {
        let elapsed = self.born.elapsed().as_millis() as u64;
        self.last_referred.store(elapsed, Ordering::Release);
    }
}

impl<H> fmt::Display for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conn#{}{{refs: {}/{}, closing: {}, readying: {}, idle_for: {:?}}}",
            self.id,
            self.ref_count(),
            self.ref_max,
            self.is_closing(),
            self.is_readying(),
            self.idle_for(),
        )
    }
}

impl<H> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("ref_count", &self.ref_count())
            .field("ref_max", &self.ref_max)
            .field("closing", &self.is_closing())
            .field("readying", &self.is_readying())
            .field("open", &self.handle.lock().is_some())
            .finish()
    }
}
