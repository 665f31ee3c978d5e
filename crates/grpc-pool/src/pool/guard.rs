//! Connection guard.

use super::{ConnRef, Pool};
use crate::{Connection, Dialer, Result};
use core::{fmt, ops::Deref};
use std::sync::Arc;

/// A reference to a pooled connection, returned to the pool on drop.
///
/// Dropping the guard is the normal way to release; it runs on every exit
/// path, including early returns and panics in the caller's request code.
pub struct PooledConnection<D: Dialer> {
    pool: Pool<D>,
    conn: Option<ConnRef<D>>,
}

impl<D: Dialer> PooledConnection<D> {
    pub(super) fn new(pool: Pool<D>, conn: ConnRef<D>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    /// Clone of the underlying transport handle for issuing requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the pool force-closed the handle during shutdown.
    pub fn handle(&self) -> Result<D::Handle> {
        self.connection().handle()
    }

    /// The pooled connection this guard refers to.
    pub fn connection(&self) -> &Arc<Connection<D::Handle>> {
        // Only `detach` and `drop` take the connection, and both consume the
        // guard.
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection taken from live guard"))
    }

    /// Returns the reference to the pool now.
    pub fn release(self) {
        drop(self);
    }

    /// Disarms the guard and hands the reference to the caller, who becomes
    /// responsible for calling [`Pool::release`] exactly once.
    pub fn detach(mut self) -> Arc<Connection<D::Handle>> {
        self.conn
            .take()
            .unwrap_or_else(|| unreachable!("connection taken from live guard"))
    }
}

impl<D: Dialer> Deref for PooledConnection<D> {
    type Target = Connection<D::Handle>;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl<D: Dialer> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&conn);
        }
    }
}

impl<D: Dialer> fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}
