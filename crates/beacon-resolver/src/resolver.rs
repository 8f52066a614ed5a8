//! Per-target resolver
//!
//! Each resolver owns two background tasks:
//!
//! - the watch loop polls the registry every `watch_interval`
//! - the update loop forwards fresh address sets to the sink
//!
//! They meet in a single-slot `watch` channel: a publish overwrites any set
//! the update loop has not consumed yet, so a slow sink never blocks a poll.

use crate::sink::AddressSink;
use async_trait::async_trait;
use beacon_core::{AddressSet, Result, Target};
use beacon_registry::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Query side of a resolver, erased over the registry type
#[async_trait]
trait Refresh: Send + Sync {
    async fn refresh(&self) -> Result<()>;
}

struct Watcher<R> {
    target: Target,
    registry: R,

    /// Last published set; the lock also serializes queries
    current: Mutex<AddressSet>,

    /// Pending-update slot, latest wins
    pending: watch::Sender<AddressSet>,

    shutdown: CancellationToken,
}

impl<R: Registry> Watcher<R> {
    /// Query the registry and publish the result.
    ///
    /// On error nothing is published, so the sink keeps the last good set.
    async fn query_and_publish(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let service = &self.target.endpoint;
        let entries = self.registry.catalog_service(service).await?;
        let addresses: AddressSet = entries
            .iter()
            .map(|entry| entry.to_instance_address(service))
            .collect();

        debug!(
            uri = %self.target,
            count = addresses.len(),
            changed = *current != addresses,
            "resolved"
        );
        *current = addresses.clone();

        if !self.shutdown.is_cancelled() {
            self.pending.send_replace(addresses);
        }
        Ok(())
    }

    async fn watch(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the builder has already resolved once.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.query_and_publish().await {
                        warn!(uri = %self.target, error = %e, "poll failed, keeping last address set");
                    }
                }
            }
        }
        debug!(uri = %self.target, "watch loop stopped");
    }
}

#[async_trait]
impl<R: Registry> Refresh for Watcher<R> {
    async fn refresh(&self) -> Result<()> {
        self.query_and_publish().await
    }
}

async fn update(
    target: Target,
    mut pending: watch::Receiver<AddressSet>,
    shutdown: CancellationToken,
    sink: Arc<dyn AddressSink>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            changed = pending.changed() => {
                if changed.is_err() {
                    break;
                }
                let addresses = pending.borrow_and_update().clone();
                if shutdown.is_cancelled() {
                    break;
                }
                sink.update_addresses(addresses);
            }
        }
    }
    debug!(uri = %target, "update loop stopped");
}

/// Handle to a running resolver.
///
/// Dropping the handle closes the resolver.
pub struct Resolver {
    target: Target,
    watcher: Arc<dyn Refresh>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Resolver {
    /// Spawn the watch and update loops for `target`.
    ///
    /// Must be called from within a Tokio runtime with a non-zero
    /// `watch_interval`, see [`beacon_core::ResolverConfig::validate`]. Nothing is
    /// published until the first poll, see [`Resolver::resolve_now`].
    pub fn start<R: Registry>(
        target: Target,
        registry: R,
        sink: Arc<dyn AddressSink>,
        watch_interval: Duration,
    ) -> Self {
        let (pending, pending_rx) = watch::channel(AddressSet::default());
        let shutdown = CancellationToken::new();

        let watcher = Arc::new(Watcher {
            target: target.clone(),
            registry,
            current: Mutex::new(AddressSet::default()),
            pending,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(update(target.clone(), pending_rx, shutdown.clone(), sink));
        tokio::spawn(watcher.clone().watch(watch_interval));

        Self {
            target,
            watcher,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Poll the registry right away, outside the timer cadence.
    ///
    /// Concurrent calls run one after another. After [`Resolver::close`] this
    /// is a no-op.
    pub async fn resolve_now(&self) -> Result<()> {
        self.watcher.refresh().await
    }

    /// Stop both loops. Repeated calls do nothing; nothing is waited on.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        info!(uri = %self.target, "resolver closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("target", &self.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}
