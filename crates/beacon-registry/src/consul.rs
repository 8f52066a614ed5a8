//! Consul HTTP API client

use crate::registry::{Registry, RegistryConnector};
use beacon_core::{
    BeaconError, CatalogEntry, HealthCheck, Registration, RegistryConfig, Result,
};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Consul agent session.
///
/// Wraps a pooled `reqwest::Client`, so clones share connections and the
/// handle is safe to use from many tasks at once.
#[derive(Clone, Debug)]
pub struct ConsulRegistry {
    client: Client,
    base: Url,
    datacenter: Option<String>,
    token: Option<String>,
}

impl ConsulRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(BeaconError::Config("registry address is empty".to_string()));
        }

        let base = Url::parse(&config.base_url())
            .map_err(|e| BeaconError::Config(format!("invalid registry address: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(BeaconError::Config(format!(
                "invalid registry address: {}",
                config.address
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BeaconError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            datacenter: config.datacenter.clone(),
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// Build a request for an API path given as segments, e.g.
    /// `["catalog", "service", name]`. Segments are percent-encoded.
    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let mut url = self.base.clone();
        // `new` rejects addresses that cannot carry a path.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1").extend(segments);
        }

        let mut request = self.client.request(method, url);
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token);
        }
        request
    }

    /// Send a write request; any failure is a registration failure
    async fn send_agent_command(&self, request: RequestBuilder, what: &str) -> Result<()> {
        let response = request
            .send()
            .await
            .map_err(|e| BeaconError::RegistrationFailed(format!("{what}: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BeaconError::RegistrationFailed(format!(
                "{what}: HTTP {status}: {text}"
            )));
        }
        Ok(())
    }
}

impl Registry for ConsulRegistry {
    async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogEntry>> {
        let response = self
            .request(Method::GET, &["catalog", "service", name])
            .send()
            .await
            .map_err(|e| BeaconError::RegistryUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BeaconError::RegistryUnreachable(format!(
                "catalog query for {name} returned HTTP {}",
                response.status()
            )));
        }

        let services: Vec<CatalogService> = response.json().await.map_err(|e| {
            BeaconError::RegistryUnreachable(format!("malformed catalog response: {e}"))
        })?;

        debug!(service = %name, count = services.len(), "catalog query");
        Ok(services.into_iter().map(CatalogEntry::from).collect())
    }

    async fn register(&self, registration: &Registration) -> Result<()> {
        let body = AgentServiceRegistration::from(registration);
        let request = self
            .request(Method::PUT, &["agent", "service", "register"])
            .json(&body);
        self.send_agent_command(request, "register").await?;

        debug!(service_id = %registration.id, "service registered");
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let request = self.request(Method::PUT, &["agent", "service", "deregister", service_id]);
        self.send_agent_command(request, "deregister").await?;

        debug!(%service_id, "service deregistered");
        Ok(())
    }

    async fn pass_ttl(&self, check_id: &str, note: &str) -> Result<()> {
        let request = self
            .request(Method::PUT, &["agent", "check", "update", check_id])
            .json(&CheckUpdate {
                status: "passing",
                output: note,
            });
        self.send_agent_command(request, "ttl update").await
    }
}

impl RegistryConnector for RegistryConfig {
    type Registry = ConsulRegistry;

    fn connect(&self) -> Result<ConsulRegistry> {
        ConsulRegistry::new(self)
    }
}

// Wire formats

/// Element of `GET /v1/catalog/service/:name`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    #[serde(default)]
    node: String,
    #[serde(default)]
    address: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    service_address: String,
    #[serde(default)]
    service_port: u16,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
    #[serde(default)]
    service_meta: Option<HashMap<String, String>>,
}

impl From<CatalogService> for CatalogEntry {
    fn from(s: CatalogService) -> Self {
        Self {
            node: s.node,
            node_address: s.address,
            service_id: s.service_id,
            service_name: s.service_name,
            service_address: s.service_address,
            service_port: s.service_port,
            tags: s.service_tags.unwrap_or_default(),
            meta: s.service_meta.unwrap_or_default(),
        }
    }
}

/// Body of `PUT /v1/agent/service/register`
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    meta: &'a HashMap<String, String>,
    check: AgentServiceCheck,
}

impl<'a> From<&'a Registration> for AgentServiceRegistration<'a> {
    fn from(r: &'a Registration) -> Self {
        Self {
            id: &r.id,
            name: &r.name,
            tags: &r.tags,
            address: &r.address,
            port: r.port,
            meta: &r.meta,
            check: AgentServiceCheck::from(&r.check),
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
    #[serde(rename = "GRPC", skip_serializing_if = "Option::is_none")]
    grpc: Option<String>,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<String>,
    deregister_critical_service_after: String,
}

impl From<&HealthCheck> for AgentServiceCheck {
    fn from(check: &HealthCheck) -> Self {
        let deregister_critical_service_after = go_duration(check.deregister_after());
        match check {
            HealthCheck::Ttl { ttl, .. } => Self {
                ttl: Some(go_duration(*ttl)),
                deregister_critical_service_after,
                ..Self::default()
            },
            HealthCheck::Grpc {
                target,
                interval,
                timeout,
                ..
            } => Self {
                grpc: Some(target.clone()),
                interval: Some(go_duration(*interval)),
                timeout: Some(go_duration(*timeout)),
                deregister_critical_service_after,
                ..Self::default()
            },
            HealthCheck::Http {
                url,
                interval,
                timeout,
                ..
            } => Self {
                http: Some(url.clone()),
                interval: Some(go_duration(*interval)),
                timeout: Some(go_duration(*timeout)),
                deregister_critical_service_after,
                ..Self::default()
            },
        }
    }
}

/// Body of `PUT /v1/agent/check/update/:check_id`
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdate<'a> {
    status: &'a str,
    output: &'a str,
}

/// Render a duration the way Consul parses it (`500ms`, `10s`, `1m0s`, `1h0m0s`)
pub fn go_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }
    if total_ms < 1000 {
        return format!("{total_ms}ms");
    }

    let secs = d.as_secs();
    let (hours, mins, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let ms = d.subsec_millis();
    let seconds = if ms == 0 {
        format!("{s}s")
    } else {
        let frac = format!("{ms:03}");
        format!("{s}.{}s", frac.trim_end_matches('0'))
    };

    if hours > 0 {
        format!("{hours}h{mins}m{seconds}")
    } else if mins > 0 {
        format!("{mins}m{seconds}")
    } else {
        seconds
    }
}
