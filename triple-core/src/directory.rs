//! Client-side endpoint directory.
//!
//! The directory subscribes to the registry for one service key and
//! republishes every snapshot as an immutable, atomically swapped value:
//! selections read one snapshot and are never torn by concurrent churn.
//! When the registry reports an empty set, the last non-empty snapshot
//! keeps serving inside a bounded grace window before selection starts
//! failing with `NoAvailableProvider`.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TripleError};
use crate::loadbalance::LoadBalance;
use crate::registry::{Listener, Registry, ServiceKey, Subscription};

/// One immutable generation of the address list.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub endpoints: Vec<Endpoint>,
    /// Cached sum of CPU weights, recomputed once per refresh.
    pub total_cpu_weight: u64,
    pub generation: u64,
}

impl Snapshot {
    pub(crate) fn build(mut endpoints: Vec<Endpoint>, generation: u64) -> Snapshot {
        // Deterministic order within a generation.
        endpoints.sort_by(|a, b| a.addr().cmp(&b.addr()));
        endpoints.dedup_by(|a, b| a.addr() == b.addr());
        let total_cpu_weight = endpoints.iter().map(|e| u64::from(e.cpu_weight())).sum();
        Snapshot {
            endpoints,
            total_cpu_weight,
            generation,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }
}

struct DirectoryState {
    current: Arc<Snapshot>,
    last_non_empty: Option<(Arc<Snapshot>, Instant)>,
    generation: u64,
}

pub(crate) type RefreshHook = Box<dyn Fn(&Snapshot) + Send + Sync>;

struct DirectoryInner {
    key: ServiceKey,
    grace_window: Duration,
    state: RwLock<DirectoryState>,
    refresh_hook: Mutex<Option<RefreshHook>>,
}

impl DirectoryInner {
    /// Apply one registry snapshot: filter, order, recompute weights, and
    /// publish atomically.
    fn apply(&self, endpoints: Vec<Endpoint>) {
        let filtered: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|ep| self.key.matches(ep))
            .collect();
        let mut state = self.state.write().expect("directory state poisoned");
        state.generation += 1;
        let snapshot = Arc::new(Snapshot::build(filtered, state.generation));
        if snapshot.len() < state.current.len() {
            debug!(
                key = %self.key,
                from = state.current.len(),
                to = snapshot.len(),
                "address list shrank"
            );
        }
        if snapshot.is_empty() {
            if state.last_non_empty.is_some() {
                warn!(key = %self.key, "registry reports no providers");
            }
        } else {
            state.last_non_empty = Some((Arc::clone(&snapshot), Instant::now()));
        }
        state.current = Arc::clone(&snapshot);
        drop(state);
        if let Some(hook) = &*self.refresh_hook.lock().expect("refresh hook poisoned") {
            hook(&snapshot);
        }
    }
}

/// Live endpoint cache for one referenced service.
pub struct Directory {
    inner: Arc<DirectoryInner>,
    registry: Arc<dyn Registry>,
    subscription: Option<Subscription>,
}

impl Directory {
    /// Subscribe to the registry and start tracking the service. The
    /// initial snapshot is delivered before this returns.
    pub fn new(
        registry: Arc<dyn Registry>,
        key: ServiceKey,
        grace_window: Duration,
    ) -> Result<Directory> {
        let inner = Arc::new(DirectoryInner {
            key: key.clone(),
            grace_window,
            state: RwLock::new(DirectoryState {
                current: Arc::new(Snapshot::build(Vec::new(), 0)),
                last_non_empty: None,
                generation: 0,
            }),
            refresh_hook: Mutex::new(None),
        });
        let listener_inner = Arc::clone(&inner);
        let listener: Listener = Arc::new(move |endpoints| listener_inner.apply(endpoints));
        let subscription = registry.subscribe(&key, listener)?;
        Ok(Directory {
            inner,
            registry,
            subscription: Some(subscription),
        })
    }

    /// Invoked after every published refresh, e.g. to pre-dial new
    /// endpoints.
    pub(crate) fn set_refresh_hook(&self, hook: RefreshHook) {
        *self
            .inner
            .refresh_hook
            .lock()
            .expect("refresh hook poisoned") = Some(hook);
    }

    pub fn key(&self) -> &ServiceKey {
        &self.inner.key
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(
            &self
                .inner
                .state
                .read()
                .expect("directory state poisoned")
                .current,
        )
    }

    /// Pick an endpoint with the given policy.
    ///
    /// An empty current list falls back to the last non-empty snapshot
    /// while it is younger than the grace window; past that the call
    /// fails with `NoAvailableProvider`.
    pub fn select(&self, policy: LoadBalance) -> Result<Endpoint> {
        let snapshot = {
            let state = self.inner.state.read().expect("directory state poisoned");
            if !state.current.is_empty() {
                Arc::clone(&state.current)
            } else {
                match &state.last_non_empty {
                    Some((stale, at)) if at.elapsed() <= self.inner.grace_window => {
                        debug!(key = %self.inner.key, "serving stale address list");
                        Arc::clone(stale)
                    }
                    _ => {
                        return Err(TripleError::NoAvailableProvider(
                            self.inner.key.canonical(),
                        ))
                    }
                }
            }
        };
        policy
            .pick(&snapshot)
            .cloned()
            .ok_or_else(|| TripleError::NoAvailableProvider(self.inner.key.canonical()))
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            let _ = self.registry.unsubscribe(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointMetadata;
    use crate::registry::MemoryRegistry;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint::new(host, 7000)
    }

    #[test]
    fn tracks_registry_membership() {
        let registry = MemoryRegistry::new();
        let key = ServiceKey::new("svc");
        let directory =
            Directory::new(registry.clone(), key.clone(), Duration::from_secs(30)).unwrap();
        assert!(directory.snapshot().is_empty());

        let lease_a = registry.register(&key, &endpoint("a")).unwrap();
        let _lease_b = registry.register(&key, &endpoint("b")).unwrap();
        assert_eq!(directory.snapshot().len(), 2);

        registry.unregister(lease_a).unwrap();
        let snapshot = directory.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.endpoints[0].host, "b");
    }

    #[test]
    fn selection_never_returns_a_removed_endpoint() {
        let registry = MemoryRegistry::new();
        let key = ServiceKey::new("svc");
        let directory =
            Directory::new(registry.clone(), key.clone(), Duration::from_secs(30)).unwrap();
        let _lease_a = registry.register(&key, &endpoint("a")).unwrap();
        let lease_b = registry.register(&key, &endpoint("b")).unwrap();
        registry.unregister(lease_b).unwrap();
        for _ in 0..32 {
            assert_eq!(directory.select(LoadBalance::Random).unwrap().host, "a");
        }
    }

    #[test]
    fn group_filter_applies_before_selection() {
        let registry = MemoryRegistry::new();
        let blue_key = ServiceKey::new("svc").with_group("blue");
        let directory =
            Directory::new(registry.clone(), blue_key, Duration::from_secs(30)).unwrap();
        // Providers announce under their own qualified keys; the registry
        // buckets the whole interface together and the directory filters.
        registry
            .register(&ServiceKey::new("svc").with_group("blue"), &endpoint("blue-host"))
            .unwrap();
        registry
            .register(&ServiceKey::new("svc").with_group("green"), &endpoint("green-host"))
            .unwrap();
        let snapshot = directory.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.endpoints[0].host, "blue-host");
    }

    #[test]
    fn unqualified_key_sees_qualified_providers() {
        let registry = MemoryRegistry::new();
        let directory = Directory::new(
            registry.clone(),
            ServiceKey::new("svc"),
            Duration::from_secs(30),
        )
        .unwrap();
        registry
            .register(&ServiceKey::new("svc").with_group("green"), &endpoint("g"))
            .unwrap();
        assert_eq!(directory.snapshot().len(), 1);
        assert_eq!(directory.select(LoadBalance::Random).unwrap().host, "g");
    }

    #[test]
    fn stale_serving_inside_grace_window() {
        let registry = MemoryRegistry::new();
        let key = ServiceKey::new("svc");
        let directory =
            Directory::new(registry.clone(), key.clone(), Duration::from_millis(150)).unwrap();
        let lease = registry.register(&key, &endpoint("a")).unwrap();
        registry.unregister(lease).unwrap();

        // Inside the grace window the stale list still serves.
        assert_eq!(directory.select(LoadBalance::Random).unwrap().host, "a");

        std::thread::sleep(Duration::from_millis(200));
        let err = directory.select(LoadBalance::Random).unwrap_err();
        assert!(matches!(err, TripleError::NoAvailableProvider(_)));
    }

    #[test]
    fn zero_grace_window_disables_stale_serving() {
        let registry = MemoryRegistry::new();
        let key = ServiceKey::new("svc");
        let directory =
            Directory::new(registry.clone(), key.clone(), Duration::ZERO).unwrap();
        let lease = registry.register(&key, &endpoint("a")).unwrap();
        registry.unregister(lease).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(directory.select(LoadBalance::Random).is_err());
    }

    #[test]
    fn empty_registry_fails_immediately() {
        let registry = MemoryRegistry::new();
        let directory = Directory::new(
            registry,
            ServiceKey::new("svc"),
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(matches!(
            directory.select(LoadBalance::CpuWeighted),
            Err(TripleError::NoAvailableProvider(_))
        ));
    }

    #[test]
    fn generation_and_weight_are_recomputed_per_refresh() {
        let registry = MemoryRegistry::new();
        let key = ServiceKey::new("svc");
        let directory =
            Directory::new(registry.clone(), key.clone(), Duration::from_secs(30)).unwrap();
        let first = directory.snapshot().generation;
        let busy = endpoint("a").with_metadata(EndpointMetadata {
            cpu: Some(40),
            ..EndpointMetadata::default()
        });
        registry.register(&key, &busy).unwrap();
        let snapshot = directory.snapshot();
        assert!(snapshot.generation > first);
        assert_eq!(snapshot.total_cpu_weight, 60);
    }
}
