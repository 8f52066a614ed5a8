//! Core types for Beacon

use crate::config::duration_millis;
use crate::error::{BeaconError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What a channel wants addresses for: `scheme://authority/endpoint`
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Selects the resolver builder
    pub scheme: String,

    /// Optional authority (usually empty)
    pub authority: String,

    /// Logical service name
    pub endpoint: String,
}

impl Target {
    pub fn new(scheme: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority: String::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Parse `scheme://authority/endpoint` or `scheme:///endpoint`
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| BeaconError::InvalidTarget(format!("missing scheme in {raw:?}")))?;
        if scheme.is_empty() {
            return Err(BeaconError::InvalidTarget(format!("empty scheme in {raw:?}")));
        }

        let (authority, endpoint) = rest
            .split_once('/')
            .ok_or_else(|| BeaconError::InvalidTarget(format!("missing endpoint in {raw:?}")))?;
        if endpoint.is_empty() {
            return Err(BeaconError::InvalidTarget(format!("empty endpoint in {raw:?}")));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

impl FromStr for Target {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

/// One dialable replica
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceAddress {
    /// `host:port`
    pub addr: String,

    /// Name the transport verifies the peer against
    pub server_name: String,
}

impl InstanceAddress {
    pub fn new(addr: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: server_name.into(),
        }
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// Full replacement set of known instances for one target.
///
/// Registry results are kept verbatim, duplicates included. Deduplication
/// belongs to the channel layer that consumes the set.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AddressSet(pub Vec<InstanceAddress>);

impl AddressSet {
    pub fn new(addresses: Vec<InstanceAddress>) -> Self {
        Self(addresses)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InstanceAddress> {
        self.0.iter()
    }

    /// `host:port` strings in registry order
    pub fn addrs(&self) -> Vec<&str> {
        self.0.iter().map(|a| a.addr.as_str()).collect()
    }
}

impl FromIterator<InstanceAddress> for AddressSet {
    fn from_iter<I: IntoIterator<Item = InstanceAddress>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for AddressSet {
    type Item = InstanceAddress;
    type IntoIter = std::vec::IntoIter<InstanceAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A registered instance as reported by a catalog query
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Registry node hosting the instance
    pub node: String,

    /// Address of that node's agent
    pub node_address: String,

    pub service_id: String,
    pub service_name: String,

    /// Service specific address; empty means "use the node address"
    pub service_address: String,

    pub service_port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

impl CatalogEntry {
    /// Host to dial, falling back to the agent's own address
    pub fn dial_host(&self) -> &str {
        if self.service_address.is_empty() {
            &self.node_address
        } else {
            &self.service_address
        }
    }

    pub fn to_instance_address(&self, server_name: &str) -> InstanceAddress {
        InstanceAddress::new(
            format!("{}:{}", self.dial_host(), self.service_port),
            server_name,
        )
    }
}

/// How the registry decides whether a registered instance is alive
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// Passive: the instance must pulse before `ttl` runs out
    Ttl {
        #[serde(with = "duration_millis")]
        ttl: Duration,
        #[serde(with = "duration_millis")]
        deregister_after: Duration,
    },

    /// Active: the registry calls the gRPC health service at `target`
    Grpc {
        target: String,
        #[serde(with = "duration_millis")]
        interval: Duration,
        #[serde(with = "duration_millis")]
        timeout: Duration,
        #[serde(with = "duration_millis")]
        deregister_after: Duration,
    },

    /// Active: the registry issues `GET url` and expects a 2xx
    Http {
        url: String,
        #[serde(with = "duration_millis")]
        interval: Duration,
        #[serde(with = "duration_millis")]
        timeout: Duration,
        #[serde(with = "duration_millis")]
        deregister_after: Duration,
    },
}

impl HealthCheck {
    /// How often the check is evaluated (the TTL window for passive checks)
    pub fn cadence(&self) -> Duration {
        match self {
            Self::Ttl { ttl, .. } => *ttl,
            Self::Grpc { interval, .. } | Self::Http { interval, .. } => *interval,
        }
    }

    pub fn deregister_after(&self) -> Duration {
        match self {
            Self::Ttl {
                deregister_after, ..
            }
            | Self::Grpc {
                deregister_after, ..
            }
            | Self::Http {
                deregister_after, ..
            } => *deregister_after,
        }
    }

    pub fn is_ttl(&self) -> bool {
        matches!(self, Self::Ttl { .. })
    }

    /// A check that deregisters before it has run even once is rejected.
    pub fn validate(&self) -> Result<()> {
        let cadence = self.cadence();
        if cadence.is_zero() {
            return Err(BeaconError::InvalidRegistration(
                "health check interval must be non-zero".to_string(),
            ));
        }
        if self.deregister_after() < cadence {
            return Err(BeaconError::InvalidRegistration(format!(
                "deregister_after ({:?}) is shorter than the check interval ({:?})",
                self.deregister_after(),
                cadence
            )));
        }
        Ok(())
    }
}

/// A server instance as advertised to the registry
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Stable for the process lifetime, unique per instance
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub meta: HashMap<String, String>,
    pub check: HealthCheck,
}

impl Registration {
    /// Instance ID derived from the service name and bind port
    pub fn service_id(name: &str, port: u16) -> String {
        format!("{name}-{port}")
    }

    /// ID of the check embedded in this registration
    pub fn check_id(&self) -> String {
        format!("service:{}", self.id)
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target = Target::parse("consul:///user-service").unwrap();
        assert_eq!(target.scheme, "consul");
        assert_eq!(target.authority, "");
        assert_eq!(target.endpoint, "user-service");
        assert_eq!(target.to_string(), "consul:///user-service");

        let target: Target = "consul://10.0.0.1:8500/orders".parse().unwrap();
        assert_eq!(target.authority, "10.0.0.1:8500");
        assert_eq!(target.endpoint, "orders");
    }

    #[test]
    fn test_parse_invalid_target() {
        assert!(Target::parse("user-service").is_err());
        assert!(Target::parse("://user").is_err());
        assert!(Target::parse("consul://").is_err());
        assert!(Target::parse("consul:///").is_err());
    }

    #[test]
    fn test_dial_host_falls_back_to_node_address() {
        let entry = CatalogEntry {
            node_address: "10.0.0.5".into(),
            service_port: 9000,
            ..Default::default()
        };
        assert_eq!(
            entry.to_instance_address("S"),
            InstanceAddress::new("10.0.0.5:9000", "S")
        );

        let entry = CatalogEntry {
            node_address: "10.0.0.5".into(),
            service_address: "192.168.1.7".into(),
            service_port: 9001,
            ..Default::default()
        };
        assert_eq!(entry.dial_host(), "192.168.1.7");
    }

    #[test]
    fn test_address_set_keeps_duplicates() {
        let set: AddressSet = vec![
            InstanceAddress::new("a:1", "S"),
            InstanceAddress::new("a:1", "S"),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
        assert_eq!(set.addrs(), vec!["a:1", "a:1"]);
    }

    #[test]
    fn test_health_check_validation() {
        let check = HealthCheck::Grpc {
            target: "10.0.0.5:9000/S".into(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(60),
        };
        assert!(check.validate().is_ok());

        // Equal to the cadence is the smallest accepted value.
        let check = HealthCheck::Grpc {
            target: "10.0.0.5:9000/S".into(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(10),
        };
        assert!(check.validate().is_ok());

        let check = HealthCheck::Ttl {
            ttl: Duration::from_secs(10),
            deregister_after: Duration::from_millis(9_999),
        };
        assert!(check.validate().is_err());

        let check = HealthCheck::Ttl {
            ttl: Duration::from_secs(30),
            deregister_after: Duration::from_secs(10),
        };
        assert!(matches!(
            check.validate(),
            Err(BeaconError::InvalidRegistration(_))
        ));

        let check = HealthCheck::Http {
            url: "http://10.0.0.5:9000/health/S".into(),
            interval: Duration::ZERO,
            timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(60),
        };
        assert!(check.validate().is_err());
    }

    #[test]
    fn test_registration_ids() {
        assert_eq!(Registration::service_id("orders", 9000), "orders-9000");

        let reg = Registration {
            id: "orders-9000".into(),
            name: "orders".into(),
            tags: vec![],
            address: "10.0.0.5".into(),
            port: 9000,
            meta: HashMap::new(),
            check: HealthCheck::Ttl {
                ttl: Duration::from_secs(15),
                deregister_after: Duration::from_secs(60),
            },
        };
        assert_eq!(reg.check_id(), "service:orders-9000");
        assert_eq!(reg.socket_addr(), "10.0.0.5:9000");
    }
}
