//! Service selection and tunnel construction

use crate::config::ServiceSpec;
use anyhow::{bail, Result};
use std::sync::Arc;
use svcproxy_tunnel::{TcpProbeTunnel, TunnelRegistration};
use tracing::{info, warn};

/// A service chosen for proxying, with the port that will be forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedService {
    pub key: String,
    pub remote_port: u16,
    pub local_port: u16,
}

/// Pick the services in `namespaces` that can be proxied
pub fn select_services(
    specs: &[ServiceSpec],
    namespaces: &[String],
) -> Result<Vec<SelectedService>> {
    let mut selected = Vec::new();

    for spec in specs {
        if !namespaces.iter().any(|ns| ns == &spec.namespace) {
            continue;
        }

        let key = spec.key();
        if spec.service_type != "ClusterIP" {
            info!(
                "Skipping service {}: type {} is not ClusterIP",
                key, spec.service_type
            );
            continue;
        }

        let Some(&remote_port) = spec.ports.first() else {
            warn!("Skipping service {}: no ports declared", key);
            continue;
        };
        if spec.ports.len() > 1 {
            info!(
                "Service {} has more than 1 port, using first: {}",
                key, remote_port
            );
        }

        selected.push(SelectedService {
            key,
            remote_port,
            local_port: spec.local_port,
        });
    }

    if selected.is_empty() {
        bail!("No services found! (namespaces: {})", namespaces.join(", "));
    }

    info!("Found {} service(s) to proxy", selected.len());
    Ok(selected)
}

/// Build a readiness handle for each selected service
pub fn tunnels(selected: &[SelectedService], listen_address: &str) -> Vec<TunnelRegistration> {
    selected
        .iter()
        .map(|service| {
            let probe =
                TcpProbeTunnel::new(listen_address, service.local_port, service.remote_port);
            TunnelRegistration::new(service.key.clone(), Arc::new(probe))
        })
        .collect()
}
