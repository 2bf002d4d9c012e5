//! Recovery from an unreachable primary cluster address.
//!
//! Two registries cooperate here: a TTL cache of addresses learned from the
//! last successful enumeration, and a registry of in-flight discoveries so
//! that a burst of failing requests runs exactly one discovery per
//! connection and every caller observes the same outcome.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use console_relay_core::ConsoleError;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::inventory::{Endpoint, Scheme};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("no seed address answered the membership query: {0}")]
    MembershipUnavailable(String),
    #[error("no cluster member answered a reachability probe")]
    NoReachableMember,
}

impl From<DiscoveryError> for ConsoleError {
    fn from(err: DiscoveryError) -> Self {
        ConsoleError::DiscoveryFailed(err.to_string())
    }
}

/// Outcome of a discovery: the address to use now plus every member address
/// found, reachable ones first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: Endpoint,
    pub known_addresses: Vec<String>,
}

pub type DiscoveryResult = Result<ResolvedEndpoint, DiscoveryError>;
pub type SharedDiscovery = Shared<BoxFuture<'static, DiscoveryResult>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpointEntry {
    pub connection_id: String,
    pub known_addresses: Vec<String>,
    pub port: u16,
    pub protocol: Scheme,
    pub recorded_at: Instant,
}

impl NodeEndpointEntry {
    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.known_addresses
            .iter()
            .map(|host| Endpoint::new(self.protocol, host.clone(), self.port))
    }

    fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.recorded_at) >= ttl
    }
}

/// Addresses learned per connection, valid for a fixed TTL.
#[derive(Clone)]
pub struct NodeEndpointCache {
    inner: Arc<NodeEndpointCacheInner>,
}

struct NodeEndpointCacheInner {
    entries: DashMap<String, NodeEndpointEntry>,
    ttl: Duration,
}

impl NodeEndpointCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(NodeEndpointCacheInner {
                entries: DashMap::new(),
                ttl,
            }),
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<NodeEndpointEntry> {
        let now = Instant::now();
        let ttl = self.inner.ttl;
        if let Some(entry) = self.inner.entries.get(connection_id) {
            if !entry.is_stale(now, ttl) {
                counter!("console_relay_node_cache_total", 1, "outcome" => "hit");
                return Some(entry.clone());
            }
        }
        // A fresh entry may have been written since the read above.
        self.inner
            .entries
            .remove_if(connection_id, |_, entry| entry.is_stale(now, ttl));
        counter!("console_relay_node_cache_total", 1, "outcome" => "miss");
        None
    }

    pub fn set(&self, connection_id: &str, addresses: Vec<String>, port: u16, protocol: Scheme) {
        self.inner.entries.insert(
            connection_id.to_owned(),
            NodeEndpointEntry {
                connection_id: connection_id.to_owned(),
                known_addresses: addresses,
                port,
                protocol,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Forgets one connection, or every connection when `None`.
    pub fn invalidate(&self, connection_id: Option<&str>) {
        match connection_id {
            Some(id) => {
                self.inner.entries.remove(id);
            }
            None => self.inner.entries.clear(),
        }
    }
}

impl Default for NodeEndpointCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

struct FailoverLock {
    generation: u64,
    pending: SharedDiscovery,
    created_at: Instant,
}

impl FailoverLock {
    fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.created_at) < ttl
    }
}

/// At most one pending discovery per connection id.
#[derive(Clone)]
pub struct FailoverLocks {
    inner: Arc<FailoverLocksInner>,
}

struct FailoverLocksInner {
    locks: Mutex<HashMap<String, FailoverLock>>,
    next_generation: AtomicU64,
    ttl: Duration,
}

impl FailoverLocksInner {
    /// Removes the entry only if it is still the registration `generation`.
    fn release(&self, connection_id: &str, generation: u64) {
        let mut locks = self.locks.lock();
        if locks
            .get(connection_id)
            .is_some_and(|current| current.generation == generation)
        {
            locks.remove(connection_id);
        }
    }
}

impl FailoverLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(FailoverLocksInner {
                locks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                ttl,
            }),
        }
    }

    pub fn get_lock(&self, connection_id: &str) -> Option<SharedDiscovery> {
        let now = Instant::now();
        let locks = self.inner.locks.lock();
        locks
            .get(connection_id)
            .filter(|lock| lock.is_live(now, self.inner.ttl))
            .map(|lock| lock.pending.clone())
    }

    /// Registers `pending` before anyone polls it. The entry is released as
    /// part of settling, before any awaiter sees the result, or once it
    /// outlives the lock TTL.
    pub fn set_lock(
        &self,
        connection_id: &str,
        pending: BoxFuture<'static, DiscoveryResult>,
    ) -> SharedDiscovery {
        let (shared, generation) = {
            let mut locks = self.inner.locks.lock();
            self.register(&mut locks, connection_id, pending, Instant::now())
        };
        self.spawn_expiry(connection_id, generation, shared.clone());
        shared
    }

    /// Get-then-set under one registry lock. Returns the pending discovery
    /// and whether this call started it.
    pub fn join_or_start<F>(&self, connection_id: &str, start: F) -> (SharedDiscovery, bool)
    where
        F: FnOnce() -> BoxFuture<'static, DiscoveryResult>,
    {
        let now = Instant::now();
        let (shared, generation) = {
            let mut locks = self.inner.locks.lock();
            if let Some(existing) = locks
                .get(connection_id)
                .filter(|lock| lock.is_live(now, self.inner.ttl))
            {
                return (existing.pending.clone(), false);
            }
            self.register(&mut locks, connection_id, start(), now)
        };
        self.spawn_expiry(connection_id, generation, shared.clone());
        (shared, true)
    }

    fn register(
        &self,
        locks: &mut HashMap<String, FailoverLock>,
        connection_id: &str,
        pending: BoxFuture<'static, DiscoveryResult>,
        now: Instant,
    ) -> (SharedDiscovery, u64) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(&self.inner);
        let owner = connection_id.to_owned();
        let shared = async move {
            let result = pending.await;
            if let Some(registry) = registry.upgrade() {
                registry.release(&owner, generation);
            }
            result
        }
        .boxed()
        .shared();
        locks.insert(
            connection_id.to_owned(),
            FailoverLock {
                generation,
                pending: shared.clone(),
                created_at: now,
            },
        );
        (shared, generation)
    }

    /// Drives the discovery even if every caller goes away and drops the
    /// entry once the TTL passes.
    fn spawn_expiry(&self, connection_id: &str, generation: u64, pending: SharedDiscovery) {
        let registry = Arc::downgrade(&self.inner);
        let connection_id = connection_id.to_owned();
        let ttl = self.inner.ttl;
        tokio::spawn(async move {
            if tokio::time::timeout(ttl, pending).await.is_err() {
                warn!(
                    connection_id = %connection_id,
                    "failover discovery outlived its lock; releasing"
                );
                if let Some(registry) = registry.upgrade() {
                    registry.release(&connection_id, generation);
                }
            }
        });
    }
}

impl Default for FailoverLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

/// Single-flight front for discovery: joins a running discovery when one is
/// registered, otherwise starts one and records its result in the cache.
#[derive(Clone, Default)]
pub struct EndpointResolver {
    cache: NodeEndpointCache,
    locks: FailoverLocks,
}

impl EndpointResolver {
    pub fn new(cache: NodeEndpointCache, locks: FailoverLocks) -> Self {
        Self { cache, locks }
    }

    pub fn cache(&self) -> &NodeEndpointCache {
        &self.cache
    }

    pub fn locks(&self) -> &FailoverLocks {
        &self.locks
    }

    pub async fn resolve<F, Fut>(&self, connection_id: &str, discover: F) -> DiscoveryResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DiscoveryResult> + Send + 'static,
    {
        let cache = self.cache.clone();
        let owner = connection_id.to_owned();
        let (pending, started) = self.locks.join_or_start(connection_id, move || {
            let discovery = discover();
            async move {
                counter!("console_relay_discovery_runs_total", 1);
                let result = discovery.await;
                if let Ok(resolved) = &result {
                    cache.set(
                        &owner,
                        resolved.known_addresses.clone(),
                        resolved.endpoint.port,
                        resolved.endpoint.scheme,
                    );
                }
                result
            }
            .boxed()
        });

        if !started {
            counter!("console_relay_discovery_joined_total", 1);
            debug!(connection_id, "joining in-flight cluster discovery");
        }

        let result = pending.await;
        match &result {
            Ok(resolved) if started => info!(
                connection_id,
                endpoint = %resolved.endpoint,
                members = resolved.known_addresses.len(),
                "cluster discovery selected a new endpoint"
            ),
            Err(err) if started => {
                counter!("console_relay_discovery_failures_total", 1);
                warn!(connection_id, error = %err, "cluster discovery failed");
            }
            _ => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolved(host: &str) -> ResolvedEndpoint {
        ResolvedEndpoint {
            endpoint: Endpoint::new(Scheme::Https, host, 8006),
            known_addresses: vec![host.to_string(), "10.0.0.12".to_string()],
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn counting_discovery(
        calls: &Arc<AtomicUsize>,
        outcome: DiscoveryResult,
    ) -> impl FnOnce() -> BoxFuture<'static, DiscoveryResult> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                outcome
            }
            .boxed()
        }
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn cache_round_trip_and_ttl() {
        let cache = NodeEndpointCache::new(Duration::from_secs(60));
        let addresses = vec!["10.0.0.11".to_string(), "10.0.0.12".to_string()];
        cache.set("lab", addresses.clone(), 8006, Scheme::Https);

        let entry = cache.get("lab").expect("fresh entry");
        assert_eq!(entry.known_addresses, addresses);
        assert_eq!(entry.port, 8006);
        assert_eq!(entry.protocol, Scheme::Https);
        assert_eq!(
            entry.endpoints().next(),
            Some(Endpoint::new(Scheme::Https, "10.0.0.11", 8006))
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("lab").is_none());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn set_overwrites_and_invalidate_clears() {
        let cache = NodeEndpointCache::new(Duration::from_secs(60));
        cache.set("lab", vec!["a".into()], 8006, Scheme::Https);
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.set("lab", vec!["b".into()], 8007, Scheme::Http);
        tokio::time::advance(Duration::from_secs(50)).await;

        let entry = cache.get("lab").expect("overwrite resets recorded_at");
        assert_eq!(entry.known_addresses, vec!["b".to_string()]);
        assert_eq!(entry.port, 8007);

        cache.set("prod", vec!["c".into()], 8006, Scheme::Https);
        cache.invalidate(Some("lab"));
        assert!(cache.get("lab").is_none());
        assert!(cache.get("prod").is_some());
        cache.invalidate(None);
        assert!(cache.get("prod").is_none());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn concurrent_resolves_share_one_discovery() {
        let resolver = EndpointResolver::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let (first, second) = tokio::join!(
            resolver.resolve("lab", counting_discovery(&calls, Ok(resolved("10.0.0.11")))),
            resolver.resolve("lab", counting_discovery(&calls, Ok(resolved("10.0.0.99")))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first.unwrap().endpoint.host, "10.0.0.11");

        let cached = resolver.cache().get("lab").expect("discovery populated cache");
        assert_eq!(cached.known_addresses[0], "10.0.0.11");
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn failure_reaches_every_waiter_and_clears_lock() {
        let resolver = EndpointResolver::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let failed = || -> DiscoveryResult { Err(DiscoveryError::NoReachableMember) };

        let (first, second) = tokio::join!(
            resolver.resolve("lab", counting_discovery(&calls, failed())),
            resolver.resolve("lab", counting_discovery(&calls, failed())),
        );
        assert_eq!(first, Err(DiscoveryError::NoReachableMember));
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resolver.cache().get("lab").is_none());
        assert!(resolver.locks().get_lock("lab").is_none());

        let retry = resolver
            .resolve("lab", counting_discovery(&calls, Ok(resolved("10.0.0.11"))))
            .await;
        assert!(retry.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn immediate_retry_after_failure_runs_new_discovery() {
        let resolver = EndpointResolver::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let instant = |outcome: DiscoveryResult| {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { outcome }.boxed()
            }
        };

        let failed = resolver
            .resolve("lab", instant(Err(DiscoveryError::NoReachableMember)))
            .await;
        assert_eq!(failed, Err(DiscoveryError::NoReachableMember));

        let retry = resolver
            .resolve("lab", instant(Ok(resolved("10.0.0.11"))))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retry.unwrap().endpoint.host, "10.0.0.11");
    }

    #[test_timeout::tokio_timeout_test]
    async fn settled_lock_is_released_before_awaiter_resumes() {
        let locks = FailoverLocks::new(Duration::from_secs(30));
        let pending = locks.set_lock(
            "lab",
            async { Err(DiscoveryError::NoReachableMember) }.boxed(),
        );
        assert!(locks.get_lock("lab").is_some());

        assert!(pending.await.is_err());
        assert!(locks.get_lock("lab").is_none());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stale_release_keeps_newer_lock() {
        let locks = FailoverLocks::new(Duration::from_secs(30));
        let first = locks.set_lock(
            "lab",
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(resolved("10.0.0.11"))
            }
            .boxed(),
        );
        let _second = locks.set_lock("lab", futures_util::future::pending().boxed());

        assert!(first.await.is_ok());
        assert!(
            locks.get_lock("lab").is_some(),
            "release of the first lock must not remove the second"
        );
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn lock_expires_after_ttl_even_if_pending() {
        let locks = FailoverLocks::new(Duration::from_secs(30));
        let _pending = locks.set_lock("lab", futures_util::future::pending().boxed());
        assert!(locks.get_lock("lab").is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(locks.get_lock("lab").is_none());

        settle().await;
        let (_, started) =
            locks.join_or_start("lab", || async { Ok(resolved("10.0.0.11")) }.boxed());
        assert!(started, "expired lock must not be joined");
    }

    #[test_timeout::timeout]
    fn discovery_error_maps_to_console_error() {
        let err: ConsoleError = DiscoveryError::NoReachableMember.into();
        assert_eq!(err.metric_label(), "discovery_failed");
    }
}
