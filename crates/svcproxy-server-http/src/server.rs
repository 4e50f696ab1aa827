//! HTTP listener and connection handling
use crate::proxy::ProxyHandler;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use svcproxy_router::{HostRouter, ServiceRegistry};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpProxyServerConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound for connecting to a backend and receiving its response headers
    pub upstream_timeout: Option<Duration>,
}

impl Default for HttpProxyServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            upstream_timeout: None,
        }
    }
}

/// Host-routed reverse proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
}

impl HttpProxyServer {
    /// Bind the listener; requests are routed through `registry`
    pub async fn bind(
        config: HttpProxyServerConfig,
        registry: Arc<ServiceRegistry>,
    ) -> Result<Self, HttpServerError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            HttpServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        let handler = ProxyHandler::new(HostRouter::new(registry))
            .with_upstream_timeout(config.upstream_timeout);

        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled, then drain open connections
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), HttpServerError> {
        let bound_addr = self.listener.local_addr()?;
        info!("HTTP proxy listening on {}", bound_addr);

        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("HTTP proxy on {} shutting down", bound_addr);
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        connections.spawn(Self::handle_connection(
                            stream,
                            peer_addr,
                            self.handler.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept HTTP connection: {}", e);
                    }
                }
            }
        }

        connections.close();
        debug!("Waiting for {} open connection(s)", connections.len());
        connections.wait().await;

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
        shutdown: CancellationToken,
    ) {
        debug!("New HTTP connection from {}", peer_addr);

        let request_shutdown = shutdown.clone();
        let service = service_fn(move |req| {
            let handler = handler.clone();
            let shutdown = request_shutdown.clone();
            async move { Ok::<_, Infallible>(handler.handle(req, &shutdown).await) }
        });

        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("HTTP connection error from {}: {}", peer_addr, e);
                }
            }
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if let Err(e) = conn.await {
                    debug!("HTTP connection error from {} during shutdown: {}", peer_addr, e);
                }
            }
        }
    }
}
