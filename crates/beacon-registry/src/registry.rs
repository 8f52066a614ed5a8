//! Registry abstraction

use beacon_core::{CatalogEntry, Registration, Result};
use std::future::Future;

/// Catalog lookup and agent registration against a service registry.
///
/// Implementations are cheap to clone and safe for concurrent use; clones
/// share the same session.
pub trait Registry: Clone + Send + Sync + 'static {
    /// All instances currently registered under `name`.
    ///
    /// An empty list is a valid answer, distinct from an error.
    fn catalog_service(&self, name: &str) -> impl Future<Output = Result<Vec<CatalogEntry>>> + Send;

    /// Register or re-register (upsert by ID) an instance
    fn register(&self, registration: &Registration) -> impl Future<Output = Result<()>> + Send;

    /// Remove an instance by service ID
    fn deregister(&self, service_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Mark a TTL check as passing
    fn pass_ttl(&self, check_id: &str, note: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Establishes a registry session
pub trait RegistryConnector: Send + Sync + 'static {
    type Registry: Registry;

    fn connect(&self) -> Result<Self::Registry>;
}
