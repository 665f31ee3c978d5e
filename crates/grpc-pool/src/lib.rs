#![doc = include_str!("../README.md")]

mod config;
mod connection;
mod dialer;
mod error;
mod pool;
mod quota;

pub use crate::config::*;
pub use crate::connection::Connection;
pub use crate::dialer::*;
pub use crate::error::*;
pub use crate::pool::{Pool, PoolStats, PooledConnection, ShutdownStatus};
pub use crate::quota::ConnQuota;
// Public re-export so downstream crates can name the channel type without
// depending on `tonic` directly.
pub use tonic::transport::Channel;
