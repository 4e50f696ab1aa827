//! Per-request forwarding
//!
//! Each request is forwarded exactly once over a fresh HTTP/1.1 connection
//! to the backend its `Host` resolves to. No retries, no response caching.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use svcproxy_router::{HostRouter, HostRouterError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Body type of every response produced by the proxy
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Errors that end a single proxied request
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No service registered for host: {0}")]
    UnknownHost(String),

    #[error("Upstream {backend} unavailable: {reason}")]
    UpstreamUnavailable { backend: String, reason: String },

    #[error("Upstream {backend} did not respond within {timeout:?}")]
    UpstreamTimeout { backend: String, timeout: Duration },

    #[error("Proxy is shutting down")]
    ShuttingDown,
}

impl From<HostRouterError> for ProxyError {
    fn from(e: HostRouterError) -> Self {
        match e {
            HostRouterError::UnknownHost(host) => ProxyError::UnknownHost(host),
            other => ProxyError::BadRequest(other.to_string()),
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UnknownHost(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Plain-text error response for the client
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.status();
        let mut response = Response::new(full_body(format!("{}\n", self)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

fn full_body(text: String) -> ProxyBody {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Routes requests by `Host` and relays backend responses verbatim
#[derive(Debug, Clone)]
pub struct ProxyHandler {
    router: HostRouter,
    upstream_timeout: Option<Duration>,
}

impl ProxyHandler {
    pub fn new(router: HostRouter) -> Self {
        Self {
            router,
            upstream_timeout: None,
        }
    }

    /// Bound the time to connect and receive response headers from a backend
    pub fn with_upstream_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Handle one request; never fails, errors become HTTP responses
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        shutdown: &CancellationToken,
    ) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();

        let result = tokio::select! {
            result = self.forward(req) => result,
            _ = shutdown.cancelled() => Err(ProxyError::ShuttingDown),
        };

        match result {
            Ok(response) => {
                info!("Response: {} {} -> {}", method, uri, response.status());
                response
            }
            Err(e) => {
                warn!("{} {} failed: {}", method, uri, e);
                e.into_response()
            }
        }
    }

    async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let host = HostRouter::extract_host(req.headers(), req.uri())?;
        let backend = self.router.lookup(&host)?;
        debug!("Selected remote endpoint: {} for Host: {}", backend, host);

        let (mut parts, body) = req.into_parts();
        parts.uri = origin_form(&parts.uri)?;
        if !parts.headers.contains_key(HOST) {
            let value = HeaderValue::from_str(&host)
                .map_err(|_| ProxyError::BadRequest(format!("Invalid host: {}", host)))?;
            parts.headers.insert(HOST, value);
        }
        let request = Request::from_parts(parts, body);

        let response = match self.upstream_timeout {
            Some(timeout) => tokio::time::timeout(timeout, send_upstream(&backend, request))
                .await
                .map_err(|_| ProxyError::UpstreamTimeout {
                    backend: backend.clone(),
                    timeout,
                })??,
            None => send_upstream(&backend, request).await?,
        };

        Ok(response.map(|body| body.boxed_unsync()))
    }
}

/// Strip scheme and authority so the backend sees an origin-form target
fn origin_form(uri: &Uri) -> Result<Uri, ProxyError> {
    let path_and_query = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::BadRequest(format!("Invalid request target: {}", e)))
}

async fn send_upstream<B>(
    backend: &str,
    request: Request<B>,
) -> Result<Response<Incoming>, ProxyError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let unavailable = |reason: String| ProxyError::UpstreamUnavailable {
        backend: backend.to_string(),
        reason,
    };

    let stream = TcpStream::connect(backend)
        .await
        .map_err(|e| unavailable(format!("connect failed: {}", e)))?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| unavailable(format!("HTTP handshake failed: {}", e)))?;

    // Drives the connection until the response body has been relayed
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection closed: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| unavailable(format!("request failed: {}", e)))
}
