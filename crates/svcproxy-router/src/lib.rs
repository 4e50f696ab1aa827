//! Host-based routing for tunneled cluster services
//!
//! Maps synthetic in-cluster hostnames (`api.default.svc.cluster.local:80`)
//! to the local endpoint of the tunnel serving them, and resolves the
//! dispatch key of an inbound HTTP request.

pub mod host;
pub mod registry;

pub use host::{HostRouter, HostRouterError};
pub use registry::{RegistryEntry, ServiceRegistry};
