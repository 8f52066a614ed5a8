//! Resolver builders and the scheme → builder table

use crate::resolver::Resolver;
use crate::sink::AddressSink;
use async_trait::async_trait;
use beacon_core::{BeaconError, ResolverConfig, Result, Target};
use beacon_registry::RegistryConnector;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Factory the transport layer calls when a channel needs a new target resolved
#[async_trait]
pub trait ResolverBuilder: Send + Sync {
    /// Scheme this builder answers for
    fn scheme(&self) -> &str;

    /// Start a resolver for `target` that publishes into `sink`.
    ///
    /// Either returns a running resolver whose first address set has already
    /// been published, or an error with nothing left running.
    async fn build(&self, target: Target, sink: Arc<dyn AddressSink>) -> Result<Resolver>;
}

/// Builds resolvers that poll a service registry
pub struct DiscoveryResolverBuilder<C> {
    scheme: String,
    connector: C,
    config: ResolverConfig,
}

impl<C: RegistryConnector> DiscoveryResolverBuilder<C> {
    pub fn new(scheme: impl Into<String>, connector: C, config: ResolverConfig) -> Self {
        Self {
            scheme: scheme.into(),
            connector,
            config,
        }
    }
}

#[async_trait]
impl<C: RegistryConnector> ResolverBuilder for DiscoveryResolverBuilder<C> {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn build(&self, target: Target, sink: Arc<dyn AddressSink>) -> Result<Resolver> {
        if target.scheme != self.scheme {
            return Err(BeaconError::InvalidTarget(format!(
                "{target} does not use scheme {}",
                self.scheme
            )));
        }

        self.config.validate()?;
        let registry = self.connector.connect()?;
        let resolver = Resolver::start(target, registry, sink, self.config.watch_interval);

        if let Err(e) = resolver.resolve_now().await {
            warn!(uri = %resolver.target(), error = %e, "initial resolve failed");
            resolver.close();
            return Err(e);
        }

        info!(
            uri = %resolver.target(),
            interval = ?self.config.watch_interval,
            "resolver started"
        );
        Ok(resolver)
    }
}

/// Scheme → builder table consulted when a channel opens.
///
/// Constructed and owned by the transport layer; there is no process-wide
/// instance.
#[derive(Default)]
pub struct ResolverRegistry {
    builders: DashMap<String, Arc<dyn ResolverBuilder>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder under its scheme, replacing any previous one
    pub fn register<B: ResolverBuilder + 'static>(&self, builder: B) {
        self.register_arc(Arc::new(builder));
    }

    pub fn register_arc(&self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme().to_string();
        if self.builders.insert(scheme.clone(), builder).is_some() {
            warn!(%scheme, "replaced resolver builder");
        }
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).map(|b| b.clone())
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.builders.iter().map(|e| e.key().clone()).collect();
        schemes.sort();
        schemes
    }

    /// Parse `raw` and build a resolver with the builder for its scheme
    pub async fn resolve(&self, raw: &str, sink: Arc<dyn AddressSink>) -> Result<Resolver> {
        let target = Target::parse(raw)?;
        let builder = self
            .get(&target.scheme)
            .ok_or_else(|| BeaconError::UnknownScheme(target.scheme.clone()))?;
        builder.build(target, sink).await
    }
}
