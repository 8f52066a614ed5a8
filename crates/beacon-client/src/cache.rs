//! Connection cache keyed by service name

use crate::dial::{Connection, Dialer, TcpDialer};
use beacon_core::{BeaconError, ClientConfig, InstanceAddress, Result};
use beacon_registry::{ConsulRegistry, Registry};
use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// At most one live outbound connection per service name.
///
/// Lookups take the read lock on the map. A miss takes a per-service dial
/// lock, so concurrent callers missing on the same name share one dial while
/// dials to different services proceed in parallel.
pub struct ConnectionCache<R, D: Dialer> {
    registry: R,
    dialer: D,

    /// Established connections
    conns: RwLock<HashMap<String, Arc<D::Connection>>>,

    /// In-flight dial locks
    dialing: DashMap<String, Arc<Mutex<()>>>,
}

impl<R: Registry, D: Dialer> ConnectionCache<R, D> {
    pub fn new(registry: R, dialer: D) -> Self {
        Self {
            registry,
            dialer,
            conns: RwLock::new(HashMap::new()),
            dialing: DashMap::new(),
        }
    }

    /// Cached connection for `service`, discovering and dialing one on a miss.
    ///
    /// Failures leave the cache untouched.
    pub async fn get_connection(&self, service: &str) -> Result<Arc<D::Connection>> {
        if let Some(conn) = self.cached(service).await {
            return Ok(conn);
        }

        let slot = DialSlot::acquire(&self.dialing, service);
        let _guard = slot.lock.lock().await;

        // Another caller may have finished the dial while we waited.
        if let Some(conn) = self.cached(service).await {
            return Ok(conn);
        }

        let instance = self.discover(service).await?;
        let fresh = Arc::new(self.dialer.dial(&instance).await?);

        let resident = {
            let mut conns = self.conns.write().await;
            match conns.entry(service.to_string()) {
                Entry::Occupied(entry) => Some(entry.get().clone()),
                Entry::Vacant(entry) => {
                    entry.insert(fresh.clone());
                    None
                }
            }
        };

        if let Some(resident) = resident {
            // Keep the connection other callers already hold.
            if let Err(e) = fresh.close().await {
                warn!(%service, error = %e, "failed to close surplus connection");
            }
            return Ok(resident);
        }

        info!(%service, addr = %instance.addr, "connection cached");
        Ok(fresh)
    }

    /// Remove and close the connection for `service`. Absent names are a no-op.
    pub async fn close_connection(&self, service: &str) -> Result<()> {
        let conn = self.conns.write().await.remove(service);
        if let Some(conn) = conn {
            conn.close().await?;
            info!(%service, "connection closed");
        }
        Ok(())
    }

    /// Close every cached connection, reporting the first failure
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<_> = self.conns.write().await.drain().collect();

        let mut first_err = None;
        for (service, conn) in drained {
            if let Err(e) = conn.close().await {
                warn!(%service, error = %e, "failed to close connection");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn contains(&self, service: &str) -> bool {
        self.conns.read().await.contains_key(service)
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }

    async fn cached(&self, service: &str) -> Option<Arc<D::Connection>> {
        self.conns.read().await.get(service).cloned()
    }

    /// One registered instance of `service`
    async fn discover(&self, service: &str) -> Result<InstanceAddress> {
        let entries = self.registry.catalog_service(service).await?;
        let entry = entries
            .first()
            .ok_or_else(|| BeaconError::ServiceNotFound(service.to_string()))?;

        debug!(%service, instances = entries.len(), "discovered");
        Ok(entry.to_instance_address(service))
    }
}

/// Connection cache discovering through Consul and dialing plain TCP
pub type ConsulConnectionCache = ConnectionCache<ConsulRegistry, TcpDialer>;

impl ConsulConnectionCache {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        if config.dial_timeout.is_zero() {
            return Err(BeaconError::Config(
                "dial_timeout must be non-zero".to_string(),
            ));
        }
        let registry = ConsulRegistry::new(&config.registry)?;
        Ok(Self::new(registry, TcpDialer::new(config.dial_timeout)))
    }
}

/// Per-service dial lock, dropped from the map by the last holder
struct DialSlot<'a> {
    dialing: &'a DashMap<String, Arc<Mutex<()>>>,
    service: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> DialSlot<'a> {
    fn acquire(dialing: &'a DashMap<String, Arc<Mutex<()>>>, service: &'a str) -> Self {
        let lock = dialing.entry(service.to_string()).or_default().clone();
        Self {
            dialing,
            service,
            lock,
        }
    }
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        // Two references left means the map and this slot: nobody else waits.
        self.dialing.remove_if(self.service, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_registry::MemoryRegistry;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug)]
    struct FakeConnection {
        addr: String,
        closed: AtomicBool,
    }

    impl Connection for FakeConnection {
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeDialer {
        dials: Arc<AtomicUsize>,
        refused: Arc<std::sync::Mutex<HashSet<String>>>,
    }

    impl FakeDialer {
        fn refuse(&self, addr: &str) {
            self.refused.lock().unwrap().insert(addr.to_string());
        }

        fn allow(&self, addr: &str) {
            self.refused.lock().unwrap().remove(addr);
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    impl Dialer for FakeDialer {
        type Connection = FakeConnection;

        async fn dial(&self, instance: &InstanceAddress) -> Result<FakeConnection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            // Wide enough for concurrent callers to pile up behind the dial lock.
            tokio::time::sleep(Duration::from_millis(20)).await;

            let refused = self.refused.lock().unwrap().contains(&instance.addr);
            if refused {
                return Err(BeaconError::DialFailed {
                    service: instance.server_name.clone(),
                    addr: instance.addr.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(FakeConnection {
                addr: instance.addr.clone(),
                closed: AtomicBool::new(false),
            })
        }
    }

    async fn cache_with(
        services: &[(&str, &str, u16)],
    ) -> (
        Arc<ConnectionCache<MemoryRegistry, FakeDialer>>,
        MemoryRegistry,
        FakeDialer,
    ) {
        let registry = MemoryRegistry::with_node_address("10.0.0.5");
        for (name, addr, port) in services {
            registry.add_instance(name, addr, *port).await;
        }
        let dialer = FakeDialer::default();
        let cache = Arc::new(ConnectionCache::new(registry.clone(), dialer.clone()));
        (cache, registry, dialer)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (cache, registry, dialer) = cache_with(&[("orders", "", 9000)]).await;

        let first = cache.get_connection("orders").await.unwrap();
        assert_eq!(first.addr, "10.0.0.5:9000");
        let second = cache.get_connection("orders").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dialer.dials(), 1);
        assert_eq!(registry.query_count(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_dial() {
        let (cache, _registry, dialer) = cache_with(&[("orders", "10.0.0.8", 9000)]).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_connection("orders").await })
            })
            .collect();

        let mut conns = Vec::new();
        for handle in handles {
            conns.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(dialer.dials(), 1);
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_unrelated_services_dial_independently() {
        let (cache, _registry, dialer) =
            cache_with(&[("orders", "10.0.0.8", 9000), ("users", "10.0.0.9", 9000)]).await;

        let (orders, users) = tokio::join!(
            cache.get_connection("orders"),
            cache.get_connection("users")
        );
        assert_eq!(orders.unwrap().addr, "10.0.0.8:9000");
        assert_eq!(users.unwrap().addr, "10.0.0.9:9000");
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let (cache, _registry, dialer) = cache_with(&[]).await;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_connection("ghost").await })
            })
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_not_found());
        }

        assert_eq!(dialer.dials(), 0);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_misses_release_dial_locks() {
        let (cache, _registry, dialer) = cache_with(&[("orders", "10.0.0.8", 9000)]).await;

        for i in 0..100 {
            assert_err!(cache.get_connection(&format!("ghost-{i}")).await);
        }
        assert!(cache.dialing.is_empty());

        dialer.refuse("10.0.0.8:9000");
        assert_err!(cache.get_connection("orders").await);
        assert!(cache.dialing.is_empty());

        dialer.allow("10.0.0.8:9000");
        assert_ok!(cache.get_connection("orders").await);
        assert!(cache.dialing.is_empty());
    }

    #[tokio::test]
    async fn test_dial_lock_outlives_waiters() {
        let (cache, _registry, dialer) = cache_with(&[("orders", "10.0.0.8", 9000)]).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_connection("orders").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(dialer.dials(), 1);
        assert!(cache.dialing.is_empty());
    }

    #[tokio::test]
    async fn test_resident_connection_wins_over_fresh_dial() {
        let (cache, _registry, dialer) = cache_with(&[("orders", "10.0.0.8", 9000)]).await;
        let resident = Arc::new(FakeConnection {
            addr: "10.0.0.1:1".to_string(),
            closed: AtomicBool::new(false),
        });

        // Hold the dial lock so the miss below queues behind it.
        let slot = DialSlot::acquire(&cache.dialing, "orders");
        let guard = slot.lock.clone().lock_owned().await;
        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_connection("orders").await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        drop(slot);

        // Plant a connection while the waiter is mid-dial.
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache
            .conns
            .write()
            .await
            .insert("orders".to_string(), resident.clone());

        let conn = pending.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&conn, &resident));
        assert!(Arc::ptr_eq(
            &cache.get_connection("orders").await.unwrap(),
            &resident
        ));
        assert_eq!(dialer.dials(), 1);
        assert!(cache.dialing.is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_cache_unchanged() {
        let (cache, _registry, dialer) = cache_with(&[("orders", "10.0.0.8", 9000)]).await;
        dialer.refuse("10.0.0.8:9000");

        let err = cache.get_connection("orders").await.unwrap_err();
        assert!(matches!(err, BeaconError::DialFailed { .. }));
        assert!(!cache.contains("orders").await);

        dialer.allow("10.0.0.8:9000");
        assert_ok!(cache.get_connection("orders").await);
        assert!(cache.contains("orders").await);
    }

    #[tokio::test]
    async fn test_registry_outage_surfaces_on_miss() {
        let (cache, registry, _dialer) = cache_with(&[("orders", "10.0.0.8", 9000)]).await;
        registry.set_unreachable(true);

        let err = cache.get_connection("orders").await.unwrap_err();
        assert!(matches!(err, BeaconError::RegistryUnreachable(_)));

        // Already cached connections are unaffected by an outage.
        registry.set_unreachable(false);
        cache.get_connection("orders").await.unwrap();
        registry.set_unreachable(true);
        assert_ok!(cache.get_connection("orders").await);
    }

    #[tokio::test]
    async fn test_close_connection() {
        let (cache, _registry, dialer) = cache_with(&[("orders", "10.0.0.8", 9000)]).await;

        assert_ok!(cache.close_connection("never-cached").await);
        assert_ok!(cache.close_connection("never-cached").await);

        let conn = cache.get_connection("orders").await.unwrap();
        assert_ok!(cache.close_connection("orders").await);
        assert!(conn.closed.load(Ordering::SeqCst));
        assert!(!cache.contains("orders").await);
        assert_ok!(cache.close_connection("orders").await);

        let fresh = cache.get_connection("orders").await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = ClientConfig {
            dial_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        let cache = ConsulConnectionCache::from_config(&config).unwrap();
        assert_eq!(cache.dialer.connect_timeout(), Duration::from_secs(2));
        assert_eq!(cache.registry.base_url(), "http://127.0.0.1:8500");
        assert!(cache.is_empty().await);

        let config = ClientConfig {
            dial_timeout: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert!(matches!(
            ConsulConnectionCache::from_config(&config),
            Err(BeaconError::Config(_))
        ));

        let mut config = ClientConfig::default();
        config.registry.address = String::new();
        assert!(matches!(
            ConsulConnectionCache::from_config(&config),
            Err(BeaconError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_close_all() {
        let (cache, _registry, _dialer) =
            cache_with(&[("orders", "10.0.0.8", 9000), ("users", "10.0.0.9", 9000)]).await;

        let orders = cache.get_connection("orders").await.unwrap();
        let users = cache.get_connection("users").await.unwrap();
        assert_ok!(cache.close_all().await);

        assert!(cache.is_empty().await);
        assert!(orders.closed.load(Ordering::SeqCst));
        assert!(users.closed.load(Ordering::SeqCst));
        assert_err!(cache.get_connection("billing").await);
    }
}
