//! svcproxy - host-routed HTTP proxy in front of cluster port-forwards
//!
//! Library half of the `svcproxy` binary: configuration, service selection
//! and the process wiring, exposed for integration tests.

pub mod app;
pub mod config;
pub mod inventory;

pub use app::App;
pub use config::{
    load_config_file, parse_service_arg, ConfigFile, Overrides, ServiceSpec, Settings,
};
