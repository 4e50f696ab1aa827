//! Process wiring: registration loop, proxy server and hosts output

use crate::config::Settings;
use crate::inventory::{select_services, tunnels};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use svcproxy_hosts::{render_hosts, update_hosts_file};
use svcproxy_router::ServiceRegistry;
use svcproxy_server_http::{HttpProxyServer, HttpProxyServerConfig};
use svcproxy_tunnel::{Registrar, RegistrationReport, TunnelRegistration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A bound proxy with the tunnels it waits for
pub struct App {
    settings: Settings,
    registry: Arc<ServiceRegistry>,
    server: HttpProxyServer,
    tunnels: Vec<TunnelRegistration>,
}

impl App {
    /// Select services and bind the proxy listener
    pub async fn bind(settings: Settings) -> Result<Self> {
        let selected = select_services(&settings.services, &settings.namespaces)?;
        let tunnels = tunnels(&selected, &settings.listen_address);

        let registry = Arc::new(ServiceRegistry::new());
        let config = HttpProxyServerConfig {
            bind_addr: settings.bind_addr()?,
            upstream_timeout: settings.upstream_timeout,
        };
        let server = HttpProxyServer::bind(config, registry.clone())
            .await
            .context("Failed to start HTTP proxy")?;

        Ok(Self {
            settings,
            registry,
            server,
            tunnels,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    /// Register services and serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            settings,
            registry,
            server,
            tunnels,
        } = self;

        let registrar = Registrar::new(registry.clone(), settings.registration_config())
            .with_tunnels(tunnels);
        let registration = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let report = registrar.run(shutdown).await;
                publish_hosts(&settings, &registry, &report);
                report
            }
        });

        server.serve(shutdown.clone()).await?;

        // The registrar observes the same token; wait for it to wind down
        match registration.await {
            Ok(report) => info!(
                "Registration ended: {} registered, {} failed",
                report.registered.len(),
                report.failed.len()
            ),
            Err(e) => error!("Registration task failed: {}", e),
        }

        Ok(())
    }
}

/// Print the hosts block, or write it into the hosts file
fn publish_hosts(settings: &Settings, registry: &ServiceRegistry, report: &RegistrationReport) {
    if report.cancelled {
        return;
    }

    let block = render_hosts(&registry.entries(), &settings.hosts_tag);
    if !settings.update_hosts {
        print!("{}", block);
        return;
    }

    match update_hosts_file(&settings.hosts_file, &block, &settings.hosts_tag) {
        Ok(()) => info!(
            "Hosts file {} updated with {} service(s)",
            settings.hosts_file.display(),
            registry.len()
        ),
        Err(e) => error!("{}", e),
    }
}
