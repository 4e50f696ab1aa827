//! Registration loop
//!
//! Drives every tunnel from "not yet usable" to "published in the registry".
//! Each service moves `Pending -> Registered` or `Pending -> TimedOut`;
//! both are terminal and a service is never polled again afterwards.

use crate::handle::{Readiness, TunnelHandle, TunnelRegistration};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use svcproxy_router::ServiceRegistry;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Registration loop settings
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Address the tunnels listen on locally
    pub listen_address: String,
    /// Appended to the service key, e.g. `.svc.cluster.local`. May be empty.
    pub hostname_suffix: String,
    /// Delay between two poll cycles
    pub poll_interval: Duration,
    /// Give up on a service that is not ready after this long. `None` waits forever.
    pub registration_timeout: Option<Duration>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            hostname_suffix: ".svc.cluster.local".to_string(),
            poll_interval: Duration::from_secs(1),
            registration_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl RegistrationConfig {
    /// Synthetic hostname for a service, including the remote port
    pub fn hostname(&self, service_key: &str, remote_port: u16) -> String {
        format!("{}{}:{}", service_key, self.hostname_suffix, remote_port)
    }

    /// Local endpoint for a tunnel port
    pub fn backend_address(&self, local_port: u16) -> String {
        format!("{}:{}", self.listen_address, local_port)
    }
}

/// Terminal registration failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error(
        "Service {service_key} was not ready after {waited:?} ({attempts} attempts){}",
        last_error_suffix(.last_error)
    )]
    Timeout {
        service_key: String,
        waited: Duration,
        attempts: u32,
        last_error: Option<String>,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(": last error: {}", e),
        None => String::new(),
    }
}

impl RegistrationError {
    pub fn service_key(&self) -> &str {
        match self {
            RegistrationError::Timeout { service_key, .. } => service_key,
        }
    }
}

/// A service that has been published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    pub service_key: String,
    pub hostname: String,
    pub backend_address: String,
    /// Poll cycle in which the tunnel was first seen ready (1-based)
    pub cycle: u32,
}

/// Outcome of a registration run
#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub registered: Vec<RegisteredService>,
    pub failed: Vec<RegistrationError>,
    /// Number of poll cycles executed
    pub cycles: u32,
    /// The run was interrupted by shutdown
    pub cancelled: bool,
}

impl RegistrationReport {
    /// Every known service was published
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

struct PendingTunnel {
    service_key: String,
    handle: Arc<dyn TunnelHandle>,
    since: Instant,
    attempts: u32,
    last_error: Option<String>,
}

/// Polls tunnel handles and publishes them into the registry
///
/// Runs to completion once every known tunnel is registered or has timed
/// out. With [`Registrar::with_additions`] it keeps running and registers
/// tunnels sent on the channel until the channel closes or shutdown.
pub struct Registrar {
    registry: Arc<ServiceRegistry>,
    config: RegistrationConfig,
    pending: Vec<PendingTunnel>,
    known: HashSet<String>,
    additions: Option<mpsc::Receiver<TunnelRegistration>>,
}

impl Registrar {
    pub fn new(registry: Arc<ServiceRegistry>, config: RegistrationConfig) -> Self {
        Self {
            registry,
            config,
            pending: Vec::new(),
            known: HashSet::new(),
            additions: None,
        }
    }

    /// Add a tunnel known at startup
    pub fn with_tunnel(mut self, registration: TunnelRegistration) -> Self {
        self.enqueue(registration);
        self
    }

    pub fn with_tunnels(
        mut self,
        registrations: impl IntoIterator<Item = TunnelRegistration>,
    ) -> Self {
        for registration in registrations {
            self.enqueue(registration);
        }
        self
    }

    /// Keep running after the initial set is done and accept new tunnels
    pub fn with_additions(mut self, additions: mpsc::Receiver<TunnelRegistration>) -> Self {
        self.additions = Some(additions);
        self
    }

    /// Number of tunnels that have not reached a terminal state
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn enqueue(&mut self, registration: TunnelRegistration) {
        if !self.known.insert(registration.service_key.clone()) {
            warn!(
                service = %registration.service_key,
                "Tunnel for service already known, ignoring duplicate"
            );
            return;
        }

        debug!(service = %registration.service_key, "Tracking tunnel");
        self.pending.push(PendingTunnel {
            service_key: registration.service_key,
            handle: registration.handle,
            since: Instant::now(),
            attempts: 0,
            last_error: None,
        });
    }

    fn drain_additions(&mut self) {
        let mut received = Vec::new();
        let mut closed = false;
        if let Some(additions) = self.additions.as_mut() {
            loop {
                match additions.try_recv() {
                    Ok(registration) => received.push(registration),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        if closed {
            debug!("Tunnel additions channel closed");
            self.additions = None;
        }

        for registration in received {
            self.enqueue(registration);
        }
    }

    /// Run the registration loop
    pub async fn run(mut self, shutdown: CancellationToken) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        info!("Registering {} service(s)", self.pending.len());

        loop {
            if shutdown.is_cancelled() {
                report.cancelled = true;
                return report;
            }

            self.drain_additions();

            if self.pending.is_empty() {
                let Some(additions) = self.additions.as_mut() else {
                    if report.failed.is_empty() {
                        info!("All services were registered!");
                    } else {
                        warn!(
                            "Registration finished: {} registered, {} failed",
                            report.registered.len(),
                            report.failed.len()
                        );
                    }
                    return report;
                };

                debug!("Waiting for new tunnels");
                let next = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    next = additions.recv() => Some(next),
                };

                match next {
                    None => {
                        report.cancelled = true;
                        return report;
                    }
                    Some(Some(registration)) => self.enqueue(registration),
                    Some(None) => {
                        debug!("Tunnel additions channel closed");
                        self.additions = None;
                    }
                }
                continue;
            }

            report.cycles += 1;
            if !self.poll_cycle(report.cycles, &mut report, &shutdown).await {
                report.cancelled = true;
                return report;
            }

            if self.pending.is_empty() {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    report.cancelled = true;
                    return report;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Check every pending tunnel once; returns `false` if interrupted by shutdown
    async fn poll_cycle(
        &mut self,
        cycle: u32,
        report: &mut RegistrationReport,
        shutdown: &CancellationToken,
    ) -> bool {
        let tunnels = std::mem::take(&mut self.pending);
        let bound = self.config.poll_interval;

        // Checks run concurrently, each bounded by the poll interval
        let outcomes = {
            let checks = join_all(
                tunnels
                    .iter()
                    .map(|tunnel| tokio::time::timeout(bound, tunnel.handle.ready())),
            );
            tokio::select! {
                _ = shutdown.cancelled() => None,
                outcomes = checks => Some(outcomes),
            }
        };
        let Some(outcomes) = outcomes else {
            self.pending = tunnels;
            return false;
        };

        for (mut tunnel, outcome) in tunnels.into_iter().zip(outcomes) {
            tunnel.attempts += 1;

            match outcome {
                Ok(Ok(Readiness::Ready {
                    local_port,
                    remote_port,
                })) => {
                    report
                        .registered
                        .push(self.publish(&tunnel.service_key, local_port, remote_port, cycle));
                    continue;
                }
                Ok(Ok(Readiness::Pending)) => {
                    debug!(
                        service = %tunnel.service_key,
                        attempt = tunnel.attempts,
                        "Connection for service is still in progress"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        service = %tunnel.service_key,
                        attempt = tunnel.attempts,
                        "Tunnel readiness check failed, will retry: {}",
                        e
                    );
                    tunnel.last_error = Some(e.to_string());
                }
                Err(_) => {
                    debug!(
                        service = %tunnel.service_key,
                        attempt = tunnel.attempts,
                        "Readiness check did not answer within {:?}",
                        bound
                    );
                    tunnel.last_error =
                        Some(format!("readiness check did not answer within {:?}", bound));
                }
            }

            if let Some(timeout) = self.config.registration_timeout {
                let waited = tunnel.since.elapsed();
                if waited >= timeout {
                    let failure = RegistrationError::Timeout {
                        service_key: tunnel.service_key,
                        waited,
                        attempts: tunnel.attempts,
                        last_error: tunnel.last_error,
                    };
                    error!("{}", failure);
                    report.failed.push(failure);
                    continue;
                }
            }

            self.pending.push(tunnel);
        }

        true
    }

    fn publish(
        &self,
        service_key: &str,
        local_port: u16,
        remote_port: u16,
        cycle: u32,
    ) -> RegisteredService {
        let hostname = self.config.hostname(service_key, remote_port);
        let backend_address = self.config.backend_address(local_port);

        self.registry.put(hostname.clone(), backend_address.clone());
        info!(
            service = %service_key,
            hostname = %hostname,
            backend = %backend_address,
            "Service registered on port {}",
            local_port
        );

        RegisteredService {
            service_key: service_key.to_string(),
            hostname,
            backend_address,
            cycle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TunnelError;
    use async_trait::async_trait;

    struct Ready(u16, u16);

    #[async_trait]
    impl TunnelHandle for Ready {
        async fn ready(&self) -> Result<Readiness, TunnelError> {
            Ok(Readiness::Ready {
                local_port: self.0,
                remote_port: self.1,
            })
        }
    }

    #[test]
    fn test_hostname_formats() {
        let config = RegistrationConfig::default();
        assert_eq!(
            config.hostname("api.default", 80),
            "api.default.svc.cluster.local:80"
        );
        assert_eq!(config.backend_address(9001), "127.0.0.1:9001");

        let short = RegistrationConfig {
            hostname_suffix: String::new(),
            ..RegistrationConfig::default()
        };
        assert_eq!(short.hostname("api.default", 80), "api.default:80");
    }

    #[test]
    fn test_duplicate_service_key_ignored() {
        let registry = Arc::new(ServiceRegistry::new());
        let registrar = Registrar::new(registry, RegistrationConfig::default())
            .with_tunnel(TunnelRegistration::new("api.default", Arc::new(Ready(9001, 80))))
            .with_tunnel(TunnelRegistration::new("api.default", Arc::new(Ready(9002, 80))));

        assert_eq!(registrar.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_registrar_completes_immediately() {
        let registry = Arc::new(ServiceRegistry::new());
        let report = Registrar::new(registry.clone(), RegistrationConfig::default())
            .run(CancellationToken::new())
            .await;

        assert!(report.is_complete());
        assert_eq!(report.cycles, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_ready_tunnel_published_first_cycle() {
        let registry = Arc::new(ServiceRegistry::new());
        let report = Registrar::new(registry.clone(), RegistrationConfig::default())
            .with_tunnel(TunnelRegistration::new("api.default", Arc::new(Ready(9001, 80))))
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.cycles, 1);
        assert_eq!(report.registered[0].cycle, 1);
        assert_eq!(
            registry.get("api.default.svc.cluster.local:80").as_deref(),
            Some("127.0.0.1:9001")
        );
    }

    #[test]
    fn test_timeout_error_display() {
        let err = RegistrationError::Timeout {
            service_key: "db.prod".to_string(),
            waited: Duration::from_secs(5),
            attempts: 6,
            last_error: Some("connection reset".to_string()),
        };

        let message = err.to_string();
        assert!(message.contains("db.prod"));
        assert!(message.contains("6 attempts"));
        assert!(message.contains("connection reset"));
        assert_eq!(err.service_key(), "db.prod");
    }
}
