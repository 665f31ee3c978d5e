//! Admission control for connection creation.

use portable_atomic::{AtomicI32, Ordering};

/// A non-blocking ticket counter bounding the number of live connections.
///
/// A ticket is taken before dialing and given back when the dial fails or the
/// connection is destroyed. Tickets are never waited for: a caller that cannot
/// get one simply skips connection creation.
#[derive(Debug)]
pub struct ConnQuota {
    remaining: AtomicI32,
    max: i32,
}

impl ConnQuota {
    pub const fn new(max: i32) -> Self {
        Self {
            remaining: AtomicI32::new(max),
            max,
        }
    }

    /// Reserves the right to create one connection.
    ///
    /// Returns `false` without blocking when the quota is exhausted.
    pub fn try_acquire(&self) -> bool {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) <= 0 {
            self.remaining.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Returns a ticket. Excess returns are dropped so the quota never grows
    /// past its maximum.
    pub fn release(&self) {
        if self.remaining.fetch_add(1, Ordering::AcqRel) >= self.max {
            self.remaining.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Restores the full quota.
    pub fn reset(&self) {
        self.remaining.store(self.max, Ordering::Release);
    }

    /// Number of tickets currently available.
    pub fn available(&self) -> i32 {
        self.remaining.load(Ordering::Acquire).max(0)
    }
}
