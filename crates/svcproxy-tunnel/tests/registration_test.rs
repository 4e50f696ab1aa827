//! Registration loop behaviour against scripted tunnels
//!
//! Runs with a paused clock so poll cycles are deterministic.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use svcproxy_router::ServiceRegistry;
use svcproxy_tunnel::{
    Readiness, RegistrationConfig, RegistrationError, Registrar, TunnelError, TunnelHandle,
    TunnelRegistration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Step {
    Pending,
    Ready(u16, u16),
    Fail,
}

/// Tunnel that replays a fixed script; the last step repeats forever
struct ScriptedTunnel {
    steps: Vec<Step>,
    polls: AtomicUsize,
    watch: Option<(Arc<ServiceRegistry>, String)>,
    published_at_poll: Mutex<Vec<bool>>,
}

impl ScriptedTunnel {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            polls: AtomicUsize::new(0),
            watch: None,
            published_at_poll: Mutex::new(Vec::new()),
        }
    }

    /// Record whether `hostname` is already in the registry each time we are polled
    fn watching(mut self, registry: Arc<ServiceRegistry>, hostname: &str) -> Self {
        self.watch = Some((registry, hostname.to_string()));
        self
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelHandle for ScriptedTunnel {
    async fn ready(&self) -> Result<Readiness, TunnelError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);

        if let Some((registry, hostname)) = &self.watch {
            self.published_at_poll
                .lock()
                .unwrap()
                .push(registry.contains(hostname));
        }

        let step = self
            .steps
            .get(n)
            .or_else(|| self.steps.last())
            .copied()
            .unwrap_or(Step::Pending);

        match step {
            Step::Pending => Ok(Readiness::Pending),
            Step::Ready(local_port, remote_port) => Ok(Readiness::Ready {
                local_port,
                remote_port,
            }),
            Step::Fail => Err(TunnelError::Transport("stream reset".to_string())),
        }
    }
}

/// Tunnel whose readiness check never answers
struct UnresponsiveTunnel {
    polls: AtomicUsize,
}

#[async_trait]
impl TunnelHandle for UnresponsiveTunnel {
    async fn ready(&self) -> Result<Readiness, TunnelError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

fn config(timeout: Option<Duration>) -> RegistrationConfig {
    RegistrationConfig {
        listen_address: "127.0.0.1".to_string(),
        hostname_suffix: ".svc.cluster.local".to_string(),
        poll_interval: Duration::from_secs(1),
        registration_timeout: timeout,
    }
}

#[tokio::test(start_paused = true)]
async fn test_eventual_registration_on_fourth_cycle() {
    let registry = Arc::new(ServiceRegistry::new());
    let hostname = "web.default.svc.cluster.local:80";
    let tunnel = Arc::new(
        ScriptedTunnel::new(vec![
            Step::Pending,
            Step::Pending,
            Step::Pending,
            Step::Ready(9100, 80),
        ])
        .watching(registry.clone(), hostname),
    );

    let report = Registrar::new(registry.clone(), config(None))
        .with_tunnel(TunnelRegistration::new("web.default", tunnel.clone()))
        .run(CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(report.cycles, 4);
    assert_eq!(report.registered.len(), 1);
    assert_eq!(report.registered[0].cycle, 4);
    assert_eq!(report.registered[0].hostname, hostname);
    assert_eq!(report.registered[0].backend_address, "127.0.0.1:9100");

    // Never visible before the fourth poll
    assert_eq!(
        *tunnel.published_at_poll.lock().unwrap(),
        vec![false, false, false, false]
    );
    assert_eq!(tunnel.polls(), 4);
    assert_eq!(registry.get(hostname).as_deref(), Some("127.0.0.1:9100"));
}

#[tokio::test(start_paused = true)]
async fn test_registered_tunnel_is_never_polled_again() {
    let registry = Arc::new(ServiceRegistry::new());
    let fast = Arc::new(ScriptedTunnel::new(vec![Step::Ready(9001, 80)]));
    let slow = Arc::new(ScriptedTunnel::new(vec![
        Step::Pending,
        Step::Pending,
        Step::Pending,
        Step::Pending,
        Step::Ready(9002, 8080),
    ]));

    let report = Registrar::new(registry.clone(), config(None))
        .with_tunnel(TunnelRegistration::new("a.default", fast.clone()))
        .with_tunnel(TunnelRegistration::new("b.default", slow.clone()))
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.cycles, 5);
    assert_eq!(fast.polls(), 1);
    assert_eq!(slow.polls(), 5);
    assert_eq!(registry.len(), 2);
    assert_eq!(
        registry.get("a.default.svc.cluster.local:80").as_deref(),
        Some("127.0.0.1:9001")
    );
    assert_eq!(
        registry.get("b.default.svc.cluster.local:8080").as_deref(),
        Some("127.0.0.1:9002")
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_does_not_block_other_services() {
    let registry = Arc::new(ServiceRegistry::new());
    let stuck = Arc::new(ScriptedTunnel::new(vec![Step::Pending]));
    let api = Arc::new(ScriptedTunnel::new(vec![
        Step::Pending,
        Step::Ready(9001, 80),
    ]));

    let report = Registrar::new(registry.clone(), config(Some(Duration::from_secs(5))))
        .with_tunnel(TunnelRegistration::new("stuck.default", stuck.clone()))
        .with_tunnel(TunnelRegistration::new("api.default", api))
        .run(CancellationToken::new())
        .await;

    assert!(!report.is_complete());
    assert_eq!(report.registered.len(), 1);
    assert_eq!(report.registered[0].service_key, "api.default");
    assert_eq!(report.failed.len(), 1);

    match &report.failed[0] {
        RegistrationError::Timeout {
            service_key,
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(service_key, "stuck.default");
            assert_eq!(*attempts, 6);
            assert!(last_error.is_none());
        }
    }

    assert_eq!(stuck.polls(), 6);
    assert_eq!(registry.len(), 1);
    assert!(registry.contains("api.default.svc.cluster.local:80"));
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_tunnel_does_not_block_other_services() {
    let registry = Arc::new(ServiceRegistry::new());
    let hung = Arc::new(UnresponsiveTunnel {
        polls: AtomicUsize::new(0),
    });
    let api = Arc::new(ScriptedTunnel::new(vec![Step::Ready(9001, 80)]));

    let report = tokio::time::timeout(
        Duration::from_secs(60),
        Registrar::new(registry.clone(), config(Some(Duration::from_secs(5))))
            .with_tunnel(TunnelRegistration::new("hung.default", hung.clone()))
            .with_tunnel(TunnelRegistration::new("api.default", api))
            .run(CancellationToken::new()),
    )
    .await
    .expect("registration loop stalled on an unresponsive tunnel");

    assert_eq!(report.registered.len(), 1);
    assert_eq!(report.registered[0].service_key, "api.default");
    assert_eq!(report.registered[0].cycle, 1);
    assert!(registry.contains("api.default.svc.cluster.local:80"));

    assert_eq!(report.failed.len(), 1);
    let message = report.failed[0].to_string();
    assert!(message.contains("hung.default"));
    assert!(message.contains("did not answer"));
    assert!(hung.polls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_unresponsive_check() {
    let registry = Arc::new(ServiceRegistry::new());
    let hung = Arc::new(UnresponsiveTunnel {
        polls: AtomicUsize::new(0),
    });
    let shutdown = CancellationToken::new();

    let registrar = Registrar::new(registry.clone(), config(None))
        .with_tunnel(TunnelRegistration::new("hung.default", hung));
    let task = tokio::spawn(registrar.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    let report = tokio::time::timeout(Duration::from_millis(100), task)
        .await
        .expect("registration loop ignored shutdown")
        .unwrap();
    assert!(report.cancelled);
    assert!(report.failed.is_empty());
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried() {
    let registry = Arc::new(ServiceRegistry::new());
    let flaky = Arc::new(ScriptedTunnel::new(vec![
        Step::Fail,
        Step::Pending,
        Step::Fail,
        Step::Ready(9200, 443),
    ]));

    let report = Registrar::new(registry.clone(), config(Some(Duration::from_secs(30))))
        .with_tunnel(TunnelRegistration::new("tls.edge", flaky))
        .run(CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(report.registered[0].cycle, 4);
    assert!(registry.contains("tls.edge.svc.cluster.local:443"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_last_transport_error() {
    let registry = Arc::new(ServiceRegistry::new());
    let broken = Arc::new(ScriptedTunnel::new(vec![Step::Fail]));

    let report = Registrar::new(registry.clone(), config(Some(Duration::from_secs(2))))
        .with_tunnel(TunnelRegistration::new("db.prod", broken))
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.failed.len(), 1);
    let message = report.failed[0].to_string();
    assert!(message.contains("db.prod"));
    assert!(message.contains("stream reset"));
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_polling() {
    let registry = Arc::new(ServiceRegistry::new());
    let stuck = Arc::new(ScriptedTunnel::new(vec![Step::Pending]));
    let shutdown = CancellationToken::new();

    let registrar = Registrar::new(registry.clone(), config(None))
        .with_tunnel(TunnelRegistration::new("stuck.default", stuck.clone()));
    let task = tokio::spawn(registrar.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    shutdown.cancel();

    let report = task.await.unwrap();
    assert!(report.cancelled);
    assert!(report.registered.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(stuck.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_mode_registers_late_tunnels() {
    let registry = Arc::new(ServiceRegistry::new());
    let early = Arc::new(ScriptedTunnel::new(vec![Step::Ready(9001, 80)]));
    let late = Arc::new(ScriptedTunnel::new(vec![
        Step::Pending,
        Step::Pending,
        Step::Ready(9002, 80),
    ]));
    let (tx, rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();

    let registrar = Registrar::new(registry.clone(), config(None))
        .with_tunnel(TunnelRegistration::new("early.default", early.clone()))
        .with_additions(rx);
    let task = tokio::spawn(registrar.run(shutdown.clone()));

    // The loop stays alive after the initial set is registered
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(registry.contains("early.default.svc.cluster.local:80"));
    assert!(!task.is_finished());

    tx.send(TunnelRegistration::new("late.default", late.clone()))
        .await
        .unwrap();
    // Duplicate keys are ignored
    tx.send(TunnelRegistration::new("early.default", early.clone()))
        .await
        .unwrap();

    for _ in 0..50 {
        if registry.contains("late.default.svc.cluster.local:80") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    assert_eq!(
        registry.get("late.default.svc.cluster.local:80").as_deref(),
        Some("127.0.0.1:9002")
    );
    assert_eq!(late.polls(), 3);
    assert_eq!(early.polls(), 1);

    shutdown.cancel();
    let report = task.await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.registered.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_mode_ends_when_channel_closes() {
    let registry = Arc::new(ServiceRegistry::new());
    let (tx, rx) = mpsc::channel(1);

    let registrar = Registrar::new(registry.clone(), config(None)).with_additions(rx);
    let task = tokio::spawn(registrar.run(CancellationToken::new()));

    tx.send(TunnelRegistration::new(
        "api.default",
        Arc::new(ScriptedTunnel::new(vec![Step::Ready(9001, 80)])),
    ))
    .await
    .unwrap();
    drop(tx);

    let report = task.await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.registered.len(), 1);
    assert!(registry.contains("api.default.svc.cluster.local:80"));
}
