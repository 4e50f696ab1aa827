//! HTTP host-based routing

use crate::ServiceRegistry;
use http::header::HOST;
use http::{HeaderMap, Uri};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// HTTP routing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostRouterError {
    #[error("Host header not found")]
    HostHeaderNotFound,

    #[error("Invalid host header: {0}")]
    InvalidHost(String),

    #[error("No service registered for host: {0}")]
    UnknownHost(String),
}

/// Resolves the backend of an HTTP request from its `Host`
#[derive(Debug, Clone)]
pub struct HostRouter {
    registry: Arc<ServiceRegistry>,
}

impl HostRouter {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Lookup the backend address for a host, exactly as received
    pub fn lookup(&self, host: &str) -> Result<String, HostRouterError> {
        trace!("Looking up HTTP route for host: {}", host);

        self.registry
            .get(host)
            .ok_or_else(|| HostRouterError::UnknownHost(host.to_string()))
    }

    /// Extract the dispatch key of a request
    ///
    /// The `Host` header wins; the URI authority is only consulted for
    /// absolute-form requests that carry no `Host` header at all.
    pub fn extract_host(headers: &HeaderMap, uri: &Uri) -> Result<String, HostRouterError> {
        if let Some(value) = headers.get(HOST) {
            let host = value
                .to_str()
                .map_err(|_| HostRouterError::InvalidHost(format!("{:?}", value)))?;
            if host.is_empty() {
                return Err(HostRouterError::InvalidHost(String::new()));
            }
            return Ok(host.to_string());
        }

        uri.authority()
            .map(|authority| authority.as_str().to_string())
            .ok_or(HostRouterError::HostHeaderNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn router() -> HostRouter {
        let registry = Arc::new(ServiceRegistry::new());
        registry.put("a.default.svc.cluster.local:80", "127.0.0.1:9001");
        HostRouter::new(registry)
    }

    #[test]
    fn test_lookup_exact() {
        let router = router();
        assert_eq!(
            router.lookup("a.default.svc.cluster.local:80").unwrap(),
            "127.0.0.1:9001"
        );
    }

    #[test]
    fn test_lookup_does_not_normalize() {
        let router = router();
        assert_eq!(
            router.lookup("a.default.svc.cluster.local"),
            Err(HostRouterError::UnknownHost(
                "a.default.svc.cluster.local".to_string()
            ))
        );
    }

    #[test]
    fn test_extract_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("a.svc.cluster.local:80"));
        let uri: Uri = "/path?q=1".parse().unwrap();

        let host = HostRouter::extract_host(&headers, &uri).unwrap();
        assert_eq!(host, "a.svc.cluster.local:80");
    }

    #[test]
    fn test_extract_host_prefers_header_over_authority() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("a.svc.cluster.local:80"));
        let uri: Uri = "http://b.svc.cluster.local:80/".parse().unwrap();

        let host = HostRouter::extract_host(&headers, &uri).unwrap();
        assert_eq!(host, "a.svc.cluster.local:80");
    }

    #[test]
    fn test_extract_host_from_absolute_uri() {
        let headers = HeaderMap::new();
        let uri: Uri = "http://b.svc.cluster.local:80/x".parse().unwrap();

        let host = HostRouter::extract_host(&headers, &uri).unwrap();
        assert_eq!(host, "b.svc.cluster.local:80");
    }

    #[test]
    fn test_extract_host_not_found() {
        let headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();

        assert_eq!(
            HostRouter::extract_host(&headers, &uri),
            Err(HostRouterError::HostHeaderNotFound)
        );
    }

    #[test]
    fn test_extract_host_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static(""));
        let uri: Uri = "/".parse().unwrap();

        assert!(matches!(
            HostRouter::extract_host(&headers, &uri),
            Err(HostRouterError::InvalidHost(_))
        ));
    }
}
