//! svcproxy - route `<service>.<namespace>.svc.cluster.local` to local port-forwards

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use svcproxy_cli::{load_config_file, parse_service_arg, App, Overrides, ServiceSpec, Settings};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

/// Host-routed HTTP proxy for cluster services reached through port-forwards
#[derive(Parser, Debug)]
#[command(name = "svcproxy")]
#[command(about = "Proxy cluster service hostnames to local port-forwards", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// YAML config file declaring services and defaults
    #[arg(short, long, env = "SVCPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Address the proxy and the port-forwards listen on
    #[arg(long, env = "SVCPROXY_LISTEN")]
    listen: Option<String>,

    /// Proxy listen port
    #[arg(short, long, env = "SVCPROXY_PORT")]
    port: Option<u16>,

    /// Namespaces to proxy, comma separated
    #[arg(short, long, env = "SVCPROXY_NAMESPACE")]
    namespace: Option<String>,

    /// Suffix appended to `service.namespace` to form the hostname
    #[arg(long, env = "SVCPROXY_HOSTNAME_SUFFIX")]
    hostname_suffix: Option<String>,

    /// Delay between readiness checks in milliseconds
    #[arg(long, env = "SVCPROXY_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Give up on a service after this many seconds (0 = wait forever)
    #[arg(long, env = "SVCPROXY_REGISTRATION_TIMEOUT_SECS")]
    registration_timeout_secs: Option<u64>,

    /// Upstream connect and response-header timeout in seconds
    #[arg(long, env = "SVCPROXY_UPSTREAM_TIMEOUT_SECS")]
    upstream_timeout_secs: Option<u64>,

    /// Service to proxy, repeatable (format: name.namespace:port=localPort)
    #[arg(short, long = "service", value_parser = parse_service)]
    services: Vec<ServiceSpec>,

    /// Write the hosts block into the hosts file instead of printing it
    #[arg(long, env = "SVCPROXY_UPDATE_HOSTS")]
    update_hosts: bool,

    /// Hosts file to update (defaults to the system hosts file)
    #[arg(long, env = "SVCPROXY_HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SVCPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_service(arg: &str) -> Result<ServiceSpec, String> {
    parse_service_arg(arg).map_err(|e| e.to_string())
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen.clone(),
            port: self.port,
            namespace: self.namespace.clone(),
            hostname_suffix: self.hostname_suffix.clone(),
            poll_interval_ms: self.poll_interval_ms,
            registration_timeout_secs: self.registration_timeout_secs,
            upstream_timeout_secs: self.upstream_timeout_secs,
            update_hosts: self.update_hosts,
            hosts_file: self.hosts_file.clone(),
            services: self.services.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let file = cli.config.as_deref().map(load_config_file).transpose()?;
    let settings = Settings::resolve(cli.overrides(), file)?;

    let app = App::bind(settings).await?;
    info!("svcproxy {} listening on {}", env!("GIT_TAG"), app.local_addr()?);

    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            // Stop waiting for Ctrl+C if the proxy exits on its own
            let _guard = shutdown.clone().drop_guard();
            app.run(shutdown).await
        }
    });

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Error listening for shutdown signal: {}", e),
        },
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    server.await??;

    info!("svcproxy stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
