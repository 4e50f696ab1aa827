//! Tunnel handle contract

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result of a readiness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The forwarding session is not usable yet. Expected while it starts.
    Pending,
    /// The session forwards `local_port` on this machine to `remote_port` in the cluster
    Ready { local_port: u16, remote_port: u16 },
}

/// Transient failures reported by a tunnel while it is being polled
///
/// These are retried exactly like [`Readiness::Pending`], but are logged as
/// warnings so a broken transport is visible to the operator.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to probe tunnel endpoint {address}: {source}")]
    Probe {
        address: String,
        source: std::io::Error,
    },

    #[error("Tunnel closed: {0}")]
    Closed(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// A forwarding session created and owned outside this crate
///
/// Implementations must be cheap to poll repeatedly and must not change
/// any state before they become ready.
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    async fn ready(&self) -> Result<Readiness, TunnelError>;
}

/// A tunnel handle paired with the service it forwards to
#[derive(Clone)]
pub struct TunnelRegistration {
    /// Service key in `service.namespace` form
    pub service_key: String,
    pub handle: Arc<dyn TunnelHandle>,
}

impl TunnelRegistration {
    pub fn new(service_key: impl Into<String>, handle: Arc<dyn TunnelHandle>) -> Self {
        Self {
            service_key: service_key.into(),
            handle,
        }
    }
}

impl fmt::Debug for TunnelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRegistration")
            .field("service_key", &self.service_key)
            .finish_non_exhaustive()
    }
}
