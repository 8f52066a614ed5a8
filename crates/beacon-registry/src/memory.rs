//! In-process registry (for development/testing)

use crate::registry::{Registry, RegistryConnector};
use beacon_core::{BeaconError, CatalogEntry, Registration, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Catalog {
    /// Instances in registration order
    entries: Vec<CatalogEntry>,

    /// Agent registrations by service ID
    registrations: HashMap<String, Registration>,

    /// TTL pulses received per check ID
    ttl_passes: HashMap<String, u64>,
}

#[derive(Default)]
struct Shared {
    catalog: RwLock<Catalog>,
    node_address: String,
    unreachable: AtomicBool,
    queries: AtomicU64,
}

/// Registry kept entirely in memory.
///
/// Clones share the same catalog, so one handle can be given to the code
/// under test while another seeds data or injects faults.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_node_address("127.0.0.1")
    }

    /// Registry whose agent reports `node_address` for every instance
    pub fn with_node_address(node_address: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                node_address: node_address.into(),
                ..Shared::default()
            }),
        }
    }

    /// Add a raw catalog entry
    pub async fn add_entry(&self, entry: CatalogEntry) {
        self.shared.catalog.write().await.entries.push(entry);
    }

    /// Add an instance of `service` on this registry's node
    pub async fn add_instance(&self, service: &str, address: &str, port: u16) {
        let entry = CatalogEntry {
            node: "memory".to_string(),
            node_address: self.shared.node_address.clone(),
            service_id: format!("{service}-{address}-{port}"),
            service_name: service.to_string(),
            service_address: address.to_string(),
            service_port: port,
            ..CatalogEntry::default()
        };
        self.add_entry(entry).await;
    }

    /// Replace every instance of `service`
    pub async fn set_instances(&self, service: &str, entries: Vec<CatalogEntry>) {
        let mut catalog = self.shared.catalog.write().await;
        catalog.entries.retain(|e| e.service_name != service);
        catalog.entries.extend(entries);
    }

    /// Drop every instance of `service`
    pub async fn remove_service(&self, service: &str) {
        self.set_instances(service, Vec::new()).await;
    }

    /// Make every operation fail as if the agent were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of catalog queries served or refused so far
    pub fn query_count(&self) -> u64 {
        self.shared.queries.load(Ordering::SeqCst)
    }

    pub async fn registration(&self, service_id: &str) -> Option<Registration> {
        self.shared
            .catalog
            .read()
            .await
            .registrations
            .get(service_id)
            .cloned()
    }

    pub async fn ttl_passes(&self, check_id: &str) -> u64 {
        self.shared
            .catalog
            .read()
            .await
            .ttl_passes
            .get(check_id)
            .copied()
            .unwrap_or(0)
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(BeaconError::RegistryUnreachable(
                "memory registry is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn entry_for(&self, registration: &Registration) -> CatalogEntry {
        CatalogEntry {
            node: "memory".to_string(),
            node_address: self.shared.node_address.clone(),
            service_id: registration.id.clone(),
            service_name: registration.name.clone(),
            service_address: registration.address.clone(),
            service_port: registration.port,
            tags: registration.tags.clone(),
            meta: registration.meta.clone(),
        }
    }
}

impl Registry for MemoryRegistry {
    async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogEntry>> {
        self.shared.queries.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;

        let catalog = self.shared.catalog.read().await;
        Ok(catalog
            .entries
            .iter()
            .filter(|e| e.service_name == name)
            .cloned()
            .collect())
    }

    async fn register(&self, registration: &Registration) -> Result<()> {
        self.ensure_reachable()
            .map_err(|e| BeaconError::RegistrationFailed(e.to_string()))?;
        if registration.name.is_empty() || registration.id.is_empty() {
            return Err(BeaconError::RegistrationFailed(
                "service name and ID are required".to_string(),
            ));
        }

        let entry = self.entry_for(registration);
        let mut catalog = self.shared.catalog.write().await;
        match catalog
            .entries
            .iter_mut()
            .find(|e| e.service_id == registration.id)
        {
            Some(existing) => *existing = entry,
            None => catalog.entries.push(entry),
        }
        catalog
            .registrations
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        self.ensure_reachable()
            .map_err(|e| BeaconError::RegistrationFailed(e.to_string()))?;

        let mut catalog = self.shared.catalog.write().await;
        catalog.entries.retain(|e| e.service_id != service_id);
        catalog.registrations.remove(service_id);
        Ok(())
    }

    async fn pass_ttl(&self, check_id: &str, _note: &str) -> Result<()> {
        self.ensure_reachable()?;

        let mut catalog = self.shared.catalog.write().await;
        let known = catalog
            .registrations
            .values()
            .any(|r| r.check_id() == check_id);
        if !known {
            return Err(BeaconError::RegistrationFailed(format!(
                "unknown check: {check_id}"
            )));
        }
        *catalog.ttl_passes.entry(check_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

impl RegistryConnector for MemoryRegistry {
    type Registry = MemoryRegistry;

    fn connect(&self) -> Result<MemoryRegistry> {
        Ok(self.clone())
    }
}
