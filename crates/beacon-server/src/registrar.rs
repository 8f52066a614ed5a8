//! Server-side registration and health-check contract

use crate::net;
use beacon_core::{BeaconError, CheckKind, HealthCheck, Registration, Result, ServiceConfig};
use beacon_registry::Registry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Advertises server instances to the registry
pub struct Registrar<R> {
    registry: R,

    /// Address written into registrations and check targets
    advertise_host: String,
}

impl<R: Registry> Registrar<R> {
    /// Registrar advertising this host's outbound IPv4 address
    pub fn new(registry: R) -> Self {
        Self::with_host(registry, net::advertise_host())
    }

    pub fn with_host(registry: R, advertise_host: impl Into<String>) -> Self {
        Self {
            registry,
            advertise_host: advertise_host.into(),
        }
    }

    pub fn advertise_host(&self) -> &str {
        &self.advertise_host
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Turn a service config into a registration record. Nothing is sent.
    pub fn build_registration(&self, config: &ServiceConfig) -> Result<Registration> {
        if config.name.is_empty() {
            return Err(BeaconError::InvalidRegistration(
                "service name is required".to_string(),
            ));
        }
        if config.port == 0 {
            return Err(BeaconError::InvalidRegistration(format!(
                "{}: port must be non-zero",
                config.name
            )));
        }

        let host = config
            .address
            .clone()
            .unwrap_or_else(|| self.advertise_host.clone());
        let check_cfg = &config.check;

        let check = match check_cfg.kind {
            CheckKind::Grpc => HealthCheck::Grpc {
                target: format!(
                    "{host}:{}/{}",
                    check_cfg.port.unwrap_or(config.port),
                    config.name
                ),
                interval: check_cfg.interval,
                timeout: check_cfg.timeout,
                deregister_after: check_cfg.deregister_after,
            },
            CheckKind::Http => HealthCheck::Http {
                url: format!(
                    "http://{host}:{}/health/{}",
                    check_cfg.port.unwrap_or(config.port),
                    config.name
                ),
                interval: check_cfg.interval,
                timeout: check_cfg.timeout,
                deregister_after: check_cfg.deregister_after,
            },
            CheckKind::Ttl => HealthCheck::Ttl {
                ttl: check_cfg.ttl,
                deregister_after: check_cfg.deregister_after,
            },
        };
        check.validate()?;

        Ok(Registration {
            id: Registration::service_id(&config.name, config.port),
            name: config.name.clone(),
            tags: config.tags.clone(),
            address: host,
            port: config.port,
            meta: config.meta.clone(),
            check,
        })
    }

    /// Register `record`, replacing any earlier registration with the same ID
    pub async fn register(&self, record: &Registration) -> Result<()> {
        record.check.validate()?;
        self.registry.register(record).await.map_err(|e| match e {
            BeaconError::RegistrationFailed(_) => e,
            other => BeaconError::RegistrationFailed(other.to_string()),
        })?;

        info!(
            service = %record.name,
            id = %record.id,
            addr = %record.socket_addr(),
            check = ?record.check,
            "registered"
        );
        Ok(())
    }

    pub async fn deregister(&self, record: &Registration) -> Result<()> {
        self.registry.deregister(&record.id).await?;
        info!(service = %record.name, id = %record.id, "deregistered");
        Ok(())
    }

    /// Keep a TTL check passing until `shutdown` fires.
    ///
    /// Pulses immediately, then every half TTL. Returns `None` for active
    /// checks, which the registry drives on its own.
    pub fn spawn_heartbeat(
        &self,
        record: &Registration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let HealthCheck::Ttl { ttl, .. } = record.check else {
            return None;
        };

        let registry = self.registry.clone();
        let check_id = record.check_id();
        let period = (ttl / 2).max(Duration::from_millis(1));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.pass_ttl(&check_id, "serving").await {
                            Ok(()) => debug!(check = %check_id, "ttl pulse"),
                            Err(e) => warn!(check = %check_id, error = %e, "ttl pulse failed"),
                        }
                    }
                }
            }
            debug!(check = %check_id, "heartbeat stopped");
        }))
    }
}
