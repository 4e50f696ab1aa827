//! Proxy configuration
//!
//! Settings come from an optional YAML file and command-line flags; flags win.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use svcproxy_tunnel::RegistrationConfig;

pub const DEFAULT_LISTEN: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_HOSTNAME_SUFFIX: &str = ".svc.cluster.local";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_REGISTRATION_TIMEOUT_SECS: u64 = 120;

/// A cluster service and the local end of its forwarding session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Kubernetes service type; only `ClusterIP` services are proxied
    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: String,
    /// Declared service ports; the first one is forwarded
    pub ports: Vec<u16>,
    /// Local port the forwarding session listens on
    pub local_port: u16,
}

impl ServiceSpec {
    /// Registry key in `service.namespace` form
    pub fn key(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    /// 0 waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_timeout_secs: Option<u64>,
    #[serde(default)]
    pub update_hosts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts_tag: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Values given on the command line; `None` falls back to the file, then defaults
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub namespace: Option<String>,
    pub hostname_suffix: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub registration_timeout_secs: Option<u64>,
    pub upstream_timeout_secs: Option<u64>,
    pub update_hosts: bool,
    pub hosts_file: Option<PathBuf>,
    pub services: Vec<ServiceSpec>,
}

/// Fully resolved settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_address: String,
    pub listen_port: u16,
    pub namespaces: Vec<String>,
    pub hostname_suffix: String,
    pub poll_interval: Duration,
    pub registration_timeout: Option<Duration>,
    pub upstream_timeout: Option<Duration>,
    pub update_hosts: bool,
    pub hosts_file: PathBuf,
    pub hosts_tag: String,
    pub services: Vec<ServiceSpec>,
}

impl Settings {
    pub fn resolve(overrides: Overrides, file: Option<ConfigFile>) -> Result<Self> {
        let file = file.unwrap_or_default();

        let listen_address = overrides
            .listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        listen_address
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid listen address: {}", listen_address))?;

        let namespaces = match overrides.namespace {
            Some(list) => split_namespaces(&list),
            None => file
                .namespaces
                .unwrap_or_else(|| vec![DEFAULT_NAMESPACE.to_string()]),
        };
        if namespaces.is_empty() {
            bail!("At least one namespace is required (use --namespace or config file)");
        }

        let poll_interval_ms = overrides
            .poll_interval_ms
            .or(file.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_interval_ms == 0 {
            bail!("Poll interval must be greater than zero");
        }

        let registration_timeout = match overrides
            .registration_timeout_secs
            .or(file.registration_timeout_secs)
            .unwrap_or(DEFAULT_REGISTRATION_TIMEOUT_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let upstream_timeout = overrides
            .upstream_timeout_secs
            .or(file.upstream_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        // Services given on the command line are added to those from the file
        let mut services = file.services;
        services.extend(overrides.services);

        // Tunnels share the proxy's listen address
        let listen_port = overrides.port.or(file.port).unwrap_or(DEFAULT_PORT);
        if let Some(service) = services
            .iter()
            .find(|service| listen_port != 0 && service.local_port == listen_port)
        {
            bail!(
                "Service {} uses local port {}, which is the proxy listen port on {}",
                service.key(),
                listen_port,
                listen_address
            );
        }

        Ok(Self {
            listen_address,
            listen_port,
            namespaces,
            hostname_suffix: overrides
                .hostname_suffix
                .or(file.hostname_suffix)
                .unwrap_or_else(|| DEFAULT_HOSTNAME_SUFFIX.to_string()),
            poll_interval: Duration::from_millis(poll_interval_ms),
            registration_timeout,
            upstream_timeout,
            update_hosts: overrides.update_hosts || file.update_hosts,
            hosts_file: overrides
                .hosts_file
                .or(file.hosts_file)
                .unwrap_or_else(svcproxy_hosts::default_hosts_path),
            hosts_tag: file
                .hosts_tag
                .unwrap_or_else(|| svcproxy_hosts::DEFAULT_TAG.to_string()),
            services,
        })
    }

    /// Address the proxy listens on
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen_address))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            listen_address: self.listen_address.clone(),
            hostname_suffix: self.hostname_suffix.clone(),
            poll_interval: self.poll_interval,
            registration_timeout: self.registration_timeout,
        }
    }
}

fn split_namespaces(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `name.namespace:remotePort=localPort` (namespace optional)
pub fn parse_service_arg(arg: &str) -> Result<ServiceSpec> {
    let usage = || format!("Invalid service '{}' (expected name.namespace:port=localPort)", arg);

    let (target, local_port) = arg.rsplit_once('=').with_context(usage)?;
    let (key, remote_port) = target.rsplit_once(':').with_context(usage)?;

    let remote_port: u16 = remote_port.parse().with_context(usage)?;
    let local_port: u16 = local_port.parse().with_context(usage)?;

    let (name, namespace) = match key.split_once('.') {
        Some((name, namespace)) => (name, namespace),
        None => (key, DEFAULT_NAMESPACE),
    };
    if name.is_empty() || namespace.is_empty() {
        bail!(usage());
    }

    Ok(ServiceSpec {
        name: name.to_string(),
        namespace: namespace.to_string(),
        service_type: default_service_type(),
        ports: vec![remote_port],
        local_port,
    })
}
