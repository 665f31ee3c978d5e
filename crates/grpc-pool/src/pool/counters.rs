//! Pool-wide atomic counters.
//!
//! These are touched on every acquire and release without taking the pool
//! lock, so they are only eventually consistent. The reaper overwrites the
//! connection counters with exact values on every pass.

use portable_atomic::{AtomicI32, Ordering};

/// A point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections in the pool, including those draining.
    pub active: i32,
    /// Connections with no references that are not closing.
    pub idle: i32,
    /// Connections marked closing but not yet removed.
    pub closing: i32,
    /// References handed out (plus in-flight acquisitions).
    pub refs: i32,
}

#[derive(Debug)]
pub(crate) struct PoolCounters {
    active: AtomicI32,
    idle: AtomicI32,
    closing: AtomicI32,
    refs: AtomicI32,
    max_conns: i32,
}

/// Increments `counter`, undoing the change if it would pass `max`.
fn add_capped(counter: &AtomicI32, max: i32) -> i32 {
    let value = counter.fetch_add(1, Ordering::AcqRel) + 1;
    if value > max {
        counter.fetch_sub(1, Ordering::AcqRel);
        return max;
    }
    value
}

/// Decrements `counter`, undoing the change if it would drop below zero.
fn sub_floored(counter: &AtomicI32) -> i32 {
    let value = counter.fetch_sub(1, Ordering::AcqRel) - 1;
    if value < 0 {
        counter.fetch_add(1, Ordering::AcqRel);
        return 0;
    }
    value
}

impl PoolCounters {
    pub(crate) const fn new(max_conns: i32) -> Self {
        Self {
            active: AtomicI32::new(0),
            idle: AtomicI32::new(0),
            closing: AtomicI32::new(0),
            refs: AtomicI32::new(0),
            max_conns,
        }
    }

    pub(crate) fn add_active(&self) -> i32 {
        add_capped(&self.active, self.max_conns)
    }

    pub(crate) fn add_idle(&self) -> i32 {
        add_capped(&self.idle, self.max_conns)
    }

    pub(crate) fn sub_idle(&self) -> i32 {
        sub_floored(&self.idle)
    }

    pub(crate) fn add_ref(&self) -> i32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn sub_ref(&self) -> i32 {
        sub_floored(&self.refs)
    }

    pub(crate) fn active(&self) -> i32 {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn closing(&self) -> i32 {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Overwrites the connection counters with values computed under the
    /// pool's exclusive lock.
    pub(crate) fn reconcile(&self, active: i32, idle: i32, closing: i32) {
        self.active.store(active, Ordering::Release);
        self.idle.store(idle, Ordering::Release);
        self.closing.store(closing, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.reconcile(0, 0, 0);
        self.refs.store(0, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Acquire),
            idle: self.idle.load(Ordering::Acquire),
            closing: self.closing.load(Ordering::Acquire),
            refs: self.refs.load(Ordering::Acquire),
        }
    }
}
