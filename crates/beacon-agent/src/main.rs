//! Beacon Agent - Registers a service and serves its health endpoint

use anyhow::Context;
use beacon_core::{CheckKind, RegistryConfig, ServiceConfig};
use beacon_registry::ConsulRegistry;
use beacon_server::{HealthReporter, Registrar};
use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "beacon-agent")]
#[command(about = "Register a service with Consul and keep its health check green")]
struct Args {
    /// Service config file (JSON); overrides the service flags below
    #[arg(long)]
    config: Option<String>,

    /// Service name
    #[arg(long, default_value = "beacon")]
    name: String,

    /// Service port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Advertised address, detected when unset
    #[arg(long)]
    address: Option<String>,

    /// Service tags
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Health check kind; gRPC checks need a gRPC server and are not served here
    #[arg(long, default_value = "http", value_parser = ["http", "ttl"])]
    check: String,

    /// Port the health endpoint listens on, the service port when unset
    #[arg(long)]
    health_port: Option<u16>,

    /// Check interval in seconds
    #[arg(long, default_value = "10")]
    interval: u64,

    /// TTL window in seconds for `--check ttl`
    #[arg(long, default_value = "15")]
    ttl: u64,

    /// Seconds a failing instance stays registered
    #[arg(long, default_value = "60")]
    deregister_after: u64,

    /// Consul agent address
    #[arg(long, default_value = "127.0.0.1:8500")]
    consul: String,

    /// Consul datacenter
    #[arg(long)]
    datacenter: Option<String>,

    /// Consul ACL token
    #[arg(long)]
    token: Option<String>,
}

impl Args {
    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading service config {path}"))?;
            let config = ServiceConfig::from_json(&raw)?;
            ensure_servable(&config)?;
            return Ok(config);
        }

        let mut config = ServiceConfig::new(&self.name, self.port);
        config.address = self.address.clone();
        config.tags = self.tags.clone();
        config.check.kind = match self.check.as_str() {
            "ttl" => CheckKind::Ttl,
            _ => CheckKind::Http,
        };
        config.check.port = self.health_port;
        config.check.interval = Duration::from_secs(self.interval);
        config.check.ttl = Duration::from_secs(self.ttl);
        config.check.deregister_after = Duration::from_secs(self.deregister_after);
        Ok(config)
    }

    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            datacenter: self.datacenter.clone(),
            token: self.token.clone(),
            ..RegistryConfig::with_address(&self.consul)
        }
    }
}

/// The agent only serves the HTTP health endpoint and TTL pulses
fn ensure_servable(config: &ServiceConfig) -> anyhow::Result<()> {
    if config.check.kind == CheckKind::Grpc {
        anyhow::bail!(
            "{}: gRPC checks need the service's own gRPC server, use http or ttl",
            config.name
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.service_config()?;
    let registry = ConsulRegistry::new(&args.registry_config())?;
    let registrar = Registrar::new(registry);
    let record = registrar.build_registration(&config)?;

    tracing::info!(
        service = %record.name,
        id = %record.id,
        consul = %args.consul,
        "Starting beacon agent"
    );

    let reporter = HealthReporter::new();
    reporter.set_serving(&record.name);

    let shutdown = CancellationToken::new();
    let health_port = config.check.port.unwrap_or(config.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", health_port))
        .await
        .with_context(|| format!("binding health endpoint on port {health_port}"))?;
    let app = reporter.router().layer(TraceLayer::new_for_http());
    let stopped = shutdown.clone().cancelled_owned();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped)
            .await
    });

    registrar.register(&record).await?;
    let heartbeat = registrar.spawn_heartbeat(&record, shutdown.child_token());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    reporter.shutdown();
    if let Err(e) = registrar.deregister(&record).await {
        tracing::warn!(error = %e, "deregistration failed, the registry will expire the instance");
    }
    shutdown.cancel();

    if let Some(heartbeat) = heartbeat {
        heartbeat.await?;
    }
    server.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_check_rejected() {
        let config = ServiceConfig::from_json(
            r#"{"name": "orders", "port": 9000, "check": {"kind": "grpc"}}"#,
        )
        .unwrap();
        assert!(ensure_servable(&config).is_err());

        let config = ServiceConfig::from_json(r#"{"name": "orders", "port": 9000}"#).unwrap();
        assert_eq!(config.check.kind, CheckKind::Http);
        assert!(ensure_servable(&config).is_ok());
    }

    #[test]
    fn test_flags_build_service_config() {
        let args = Args::parse_from([
            "beacon-agent",
            "--name",
            "orders",
            "--port",
            "9000",
            "--check",
            "ttl",
        ]);
        let config = args.service_config().unwrap();
        assert_eq!(config.name, "orders");
        assert_eq!(config.check.kind, CheckKind::Ttl);

        assert!(Args::try_parse_from(["beacon-agent", "--check", "grpc"]).is_err());
    }
}
