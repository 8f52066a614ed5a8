//! Configuration types for Beacon

use crate::error::{BeaconError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Where and how to reach the service registry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Agent address as `host:port`
    pub address: String,

    /// `http` or `https`
    pub scheme: String,

    /// Datacenter to query, agent default when unset
    pub datacenter: Option<String>,

    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,

    /// Per-request timeout
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl RegistryConfig {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Base URL of the HTTP API, e.g. `http://127.0.0.1:8500`
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("{}://{}", self.scheme, self.address.trim_end_matches('/'))
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            scheme: "http".to_string(),
            datacenter: None,
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Resolver polling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Interval between catalog polls
    #[serde(with = "duration_millis")]
    pub watch_interval: Duration,
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watch_interval.is_zero() {
            return Err(BeaconError::Config(
                "watch_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            watch_interval: Duration::from_secs(20),
        }
    }
}

/// Client-side configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub registry: RegistryConfig,
    pub resolver: ResolverConfig,

    /// Connect timeout for the connection cache
    #[serde(with = "duration_millis")]
    pub dial_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            resolver: ResolverConfig::default(),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Kind of health check a server advertises
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Registry calls the gRPC health service, which the embedding gRPC
    /// server must expose on the check port
    Grpc,
    /// Registry calls the HTTP health endpoint
    #[default]
    Http,
    /// Server pulses a TTL check itself
    Ttl,
}

/// Health check parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub kind: CheckKind,

    /// Port the health endpoint listens on, the service port when unset
    pub port: Option<u16>,

    /// Active check interval
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Active check timeout
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// TTL window for passive checks
    #[serde(with = "duration_millis")]
    pub ttl: Duration,

    /// Continuous failure time after which the registry drops the instance
    #[serde(with = "duration_millis")]
    pub deregister_after: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            kind: CheckKind::Http,
            port: None,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            ttl: Duration::from_secs(15),
            deregister_after: Duration::from_secs(60),
        }
    }
}

/// Server-side service identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Logical service name
    pub name: String,

    /// Bind port
    pub port: u16,

    /// Advertised address, detected from the host when unset
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub meta: HashMap<String, String>,

    #[serde(default)]
    pub check: HealthCheckConfig,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            address: None,
            tags: Vec::new(),
            meta: HashMap::new(),
            check: HealthCheckConfig::default(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| BeaconError::Config(e.to_string()))
    }
}

// Serde helper for Duration
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
