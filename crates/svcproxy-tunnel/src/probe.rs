//! Readiness probe for an already established port-forward
//!
//! Treats a tunnel as ready once its local port accepts TCP connections.

use crate::handle::{Readiness, TunnelError, TunnelHandle};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Tunnel handle backed by a local TCP listener
#[derive(Debug, Clone)]
pub struct TcpProbeTunnel {
    listen_address: String,
    local_port: u16,
    remote_port: u16,
    connect_timeout: Duration,
}

impl TcpProbeTunnel {
    pub fn new(listen_address: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            listen_address: listen_address.into(),
            local_port,
            remote_port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Local endpoint that is probed
    pub fn address(&self) -> String {
        format!("{}:{}", self.listen_address, self.local_port)
    }
}

#[async_trait]
impl TunnelHandle for TcpProbeTunnel {
    async fn ready(&self) -> Result<Readiness, TunnelError> {
        let address = self.address();

        let result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address)).await;
        match result {
            Ok(Ok(_stream)) => Ok(Readiness::Ready {
                local_port: self.local_port,
                remote_port: self.remote_port,
            }),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
                ) =>
            {
                trace!("Tunnel endpoint {} not listening yet: {}", address, e);
                Ok(Readiness::Pending)
            }
            Ok(Err(e)) => Err(TunnelError::Probe { address, source: e }),
            Err(_) => {
                trace!("Tunnel endpoint {} probe timed out", address);
                Ok(Readiness::Pending)
            }
        }
    }
}
