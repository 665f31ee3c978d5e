//! Error types for the connection pool.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure of the pool and its connections. It
//! implements `From<Error>` for `tonic::Status` so that a service built on top
//! of the pool can forward pool failures to its own clients with a matching
//! gRPC status code.
//!
//! ## Error Cases
//! - `TooManyReferences`: A connection is already at its reference cap.
//! - `ConnectionClosing`: The connection is draining and accepts no new users.
//! - `ConnectionClosed`: The underlying handle has already been released.
//! - `NoConnectionAvailable`: The pool has nothing to hand out.
//! - `WaitReadyTimeout`: No connection became ready before the deadline.
//! - `TargetNotAvailable`: The pool was configured without a target.
//! - `InvalidConfig`: A configuration value cannot be used.
//! - `Dial` / `DialTimeout`: Establishing a new connection failed.
//! - `PoolClosed`: The pool has been shut down.

use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the connection pool.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A non-forced acquisition would exceed the connection's reference cap.
    #[error("Connection has too many references (max {max})")]
    TooManyReferences { max: i32 },

    /// The connection is marked closing and cannot be referenced again.
    #[error("Connection is closing")]
    ConnectionClosing,

    /// The connection's handle has already been released.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The pool has no live connection to offer.
    #[error("No connection available")]
    NoConnectionAvailable,

    /// No connection became ready within the caller's deadline.
    #[error("Wait connection ready timeout after {waited:?}")]
    WaitReadyTimeout { waited: Duration },

    /// The pool was configured without a target endpoint.
    #[error("Target not available")]
    TargetNotAvailable,

    /// A configuration value was rejected.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// The transport failed to establish a connection.
    #[error("Dial {target} failed: {reason}")]
    Dial { target: String, reason: String },

    /// The transport did not establish a connection in time.
    #[error("Dial {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    /// The pool has been closed.
    #[error("Pool is closed")]
    PoolClosed,
}

impl Error {
    /// Returns `true` if retrying against another connection may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TooManyReferences { .. } | Self::ConnectionClosing | Self::ConnectionClosed
        )
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::TooManyReferences { max } => {
                Status::resource_exhausted(format!("Connection at reference cap ({max})"))
            }
            Error::ConnectionClosing | Error::ConnectionClosed => {
                Status::unavailable(err.to_string())
            }
            Error::NoConnectionAvailable => Status::unavailable("No connection available"),
            Error::WaitReadyTimeout { waited } => {
                Status::deadline_exceeded(format!("No connection ready after {waited:?}"))
            }
            Error::TargetNotAvailable => Status::failed_precondition("Target not available"),
            Error::InvalidConfig { reason } => Status::invalid_argument(reason),
            Error::Dial { target, reason } => {
                Status::unavailable(format!("Dial {target} failed: {reason}"))
            }
            Error::DialTimeout { target, timeout } => {
                Status::deadline_exceeded(format!("Dial {target} timed out after {timeout:?}"))
            }
            Error::PoolClosed => Status::unavailable("Pool is closed"),
        }
    }
}
