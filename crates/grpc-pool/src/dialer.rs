//! Establishing new transport connections.
//!
//! The pool is agnostic of how a connection is opened. It only needs a
//! [`Dialer`] that produces a cloneable handle, which it then wraps in a
//! [`Connection`](crate::Connection). [`TonicDialer`] is the implementation for
//! [`tonic`] channels.

use crate::{Error, Result};
use core::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Opens new transport connections for the pool.
///
/// Implementations should honor their own dial deadline; the pool also bounds
/// every dial by [`PoolConfig::dial_timeout`](crate::PoolConfig::dial_timeout).
pub trait Dialer: Send + Sync + 'static {
    /// Handle callers use to issue requests. Cloning must be cheap.
    type Handle: Clone + Send + Sync + 'static;

    /// Dials one connection.
    ///
    /// With `block` set the future resolves only once the transport is
    /// established; otherwise the handle may connect lazily on first use.
    fn dial(&self, block: bool) -> impl Future<Output = Result<Self::Handle>> + Send;

    /// Human-readable destination, used in logs and errors.
    fn target(&self) -> &str;
}

/// A [`Dialer`] producing [`tonic`] [`Channel`]s to a single endpoint.
#[derive(Debug, Clone)]
pub struct TonicDialer {
    target: String,
    endpoint: Endpoint,
    timeout: Duration,
}

impl TonicDialer {
    /// Builds a dialer for `target`. A target without a scheme is treated as
    /// plaintext `http://`.
    ///
    /// # Errors
    ///
    /// - [`Error::TargetNotAvailable`] if `target` is empty.
    /// - [`Error::InvalidConfig`] if `target` is not a valid URI.
    pub fn new(target: &str, timeout: Duration) -> Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            return Err(Error::TargetNotAvailable);
        }

        let uri = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Error::InvalidConfig {
                reason: format!("invalid target {target}: {e}"),
            })?
            .connect_timeout(timeout);

        Ok(Self {
            target: uri,
            endpoint,
            timeout,
        })
    }

    /// Applies further settings (TLS, keep-alive, ...) to the endpoint used
    /// for every dial.
    #[must_use]
    pub fn with_endpoint(mut self, f: impl FnOnce(Endpoint) -> Endpoint) -> Self {
        self.endpoint = f(self.endpoint);
        self
    }
}

impl Dialer for TonicDialer {
    type Handle = Channel;

    async fn dial(&self, block: bool) -> Result<Channel> {
        if !block {
            return Ok(self.endpoint.connect_lazy());
        }

        match tokio::time::timeout(self.timeout, self.endpoint.connect()).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(Error::Dial {
                target: self.target.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::DialTimeout {
                target: self.target.clone(),
                timeout: self.timeout,
            }),
        }
    }

    fn target(&self) -> &str {
        &self.target
    }
}
