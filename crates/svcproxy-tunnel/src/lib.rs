//! Tunnel readiness and service registration
//!
//! A [`TunnelHandle`] is an externally managed forwarding session that
//! becomes usable at some point after it is created. The [`Registrar`]
//! polls every handle until it reports its ports, then publishes the
//! synthetic hostname of the service into the shared
//! [`svcproxy_router::ServiceRegistry`] exactly once.

pub mod handle;
pub mod probe;
pub mod registrar;

pub use handle::{Readiness, TunnelError, TunnelHandle, TunnelRegistration};
pub use probe::TcpProbeTunnel;
pub use registrar::{
    RegisteredService, RegistrationConfig, RegistrationError, RegistrationReport, Registrar,
};
