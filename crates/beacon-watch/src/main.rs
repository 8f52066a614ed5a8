//! Beacon Watch - Streams the resolved address set of a target

use beacon_client::ConsulConnectionCache;
use beacon_core::{AddressSet, ClientConfig, RegistryConfig, ResolverConfig};
use beacon_resolver::{AddressSink, DiscoveryResolverBuilder, ResolverRegistry};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "beacon-watch")]
#[command(about = "Print every address set the resolver publishes for a target")]
struct Args {
    /// Target URI, e.g. consul:///user-service
    target: String,

    /// Consul agent address
    #[arg(long, default_value = "127.0.0.1:8500")]
    consul: String,

    /// Consul datacenter
    #[arg(long)]
    datacenter: Option<String>,

    /// Consul ACL token
    #[arg(long)]
    token: Option<String>,

    /// Poll interval in seconds
    #[arg(long, default_value = "20", value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Also open a cached connection to one instance of the target's service
    #[arg(long)]
    dial: bool,

    /// Connect timeout in milliseconds for `--dial`
    #[arg(long, default_value = "5000", value_parser = clap::value_parser!(u64).range(1..))]
    dial_timeout: u64,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            registry: RegistryConfig {
                datacenter: self.datacenter.clone(),
                token: self.token.clone(),
                ..RegistryConfig::with_address(&self.consul)
            },
            resolver: ResolverConfig {
                watch_interval: Duration::from_secs(self.interval),
            },
            dial_timeout: Duration::from_millis(self.dial_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.client_config();

    let resolvers = ResolverRegistry::new();
    resolvers.register(DiscoveryResolverBuilder::new(
        "consul",
        config.registry.clone(),
        config.resolver.clone(),
    ));

    let (tx, mut rx) = mpsc::unbounded_channel::<AddressSet>();
    let sink: Arc<dyn AddressSink> = Arc::new(move |addresses: AddressSet| {
        let _ = tx.send(addresses);
    });

    tracing::info!(target_uri = %args.target, consul = %args.consul, "Starting beacon watch");
    let resolver = resolvers.resolve(&args.target, sink).await?;

    let cache = if args.dial {
        let cache = ConsulConnectionCache::from_config(&config)?;
        let service = &resolver.target().endpoint;
        match cache.get_connection(service).await {
            Ok(conn) => tracing::info!(%service, peer = %conn.peer().addr, "connected"),
            Err(e) => tracing::warn!(%service, error = %e, "dial failed"),
        }
        Some(cache)
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = rx.recv() => match update {
                Some(addresses) => println!("{}", serde_json::to_string(&addresses)?),
                None => break,
            },
        }
    }

    resolver.close();
    if let Some(cache) = cache {
        cache.close_all().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_from_flags() {
        let args = Args::parse_from([
            "beacon-watch",
            "consul:///orders",
            "--interval",
            "5",
            "--dial-timeout",
            "250",
        ]);
        let config = args.client_config();
        assert_eq!(config.resolver.watch_interval, Duration::from_secs(5));
        assert_eq!(config.dial_timeout, Duration::from_millis(250));
        assert!(ConsulConnectionCache::from_config(&config).is_ok());

        let zero = ["beacon-watch", "consul:///orders", "--interval", "0"];
        assert!(Args::try_parse_from(zero).is_err());
    }
}
