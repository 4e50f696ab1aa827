//! Host-routed HTTP reverse proxy
//!
//! Accepts HTTP/1.x requests, resolves the backend from the `Host` header
//! through the service registry and forwards each request over its own
//! upstream connection. Failures are turned into HTTP error responses;
//! nothing a single request does can stop the server.

mod proxy;
mod server;

pub use proxy::{ProxyBody, ProxyError, ProxyHandler};
pub use server::{HttpProxyServer, HttpProxyServerConfig, HttpServerError};
