//! In-process registry.
//!
//! The reference implementation for tests and single-process wiring, and
//! the behavioral model every remote backend must match: leased
//! registration, snapshot delivery on subscribe, and a fresh snapshot to
//! every listener on every change. Providers are bucketed per interface,
//! exactly like the Zookeeper layout (`/dubbo/<interface>/providers`):
//! listeners see the interface's full provider set, and group/version
//! filtering is the subscriber's concern (the directory applies it
//! before selection).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TripleError};
use crate::registry::{Lease, Listener, Registry, ServiceKey, Subscription};

#[derive(Default)]
struct InterfaceState {
    providers: HashMap<u64, Endpoint>,
    listeners: HashMap<u64, Listener>,
}

impl InterfaceState {
    fn snapshot(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.providers.values().cloned().collect();
        endpoints.sort_by(|a, b| a.addr().cmp(&b.addr()));
        endpoints
    }

    fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.listeners.is_empty()
    }
}

/// An in-memory [`Registry`].
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<HashMap<String, InterfaceState>>,
    next_id: AtomicU64,
}

impl MemoryRegistry {
    pub fn new() -> Arc<MemoryRegistry> {
        Arc::new(MemoryRegistry::default())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot the current provider set of an interface, for
    /// diagnostics.
    pub fn providers(&self, key: &ServiceKey) -> Vec<Endpoint> {
        let state = self.state.lock().expect("registry state poisoned");
        state
            .get(&key.interface)
            .map(InterfaceState::snapshot)
            .unwrap_or_default()
    }

    fn notify(bucket: &InterfaceState) {
        let snapshot = bucket.snapshot();
        for listener in bucket.listeners.values() {
            listener(snapshot.clone());
        }
    }
}

impl Registry for MemoryRegistry {
    fn register(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<Lease> {
        let mut endpoint = endpoint.clone();
        // The key's qualifiers ride on the endpoint so that subscribers
        // can filter.
        if endpoint.metadata.group.is_none() {
            endpoint.metadata.group = key.group.clone();
        }
        if endpoint.metadata.version.is_none() {
            endpoint.metadata.version = key.version.clone();
        }
        let id = self.next_id();
        let mut state = self.state.lock().expect("registry state poisoned");
        let bucket = state.entry(key.interface.clone()).or_default();
        bucket.providers.insert(id, endpoint.clone());
        debug!(key = %key, endpoint = %endpoint, "provider registered");
        Self::notify(bucket);
        Ok(Lease {
            id,
            key: key.clone(),
            endpoint,
        })
    }

    fn unregister(&self, lease: Lease) -> Result<()> {
        let mut state = self.state.lock().expect("registry state poisoned");
        let bucket = state.get_mut(&lease.key.interface).ok_or_else(|| {
            TripleError::IllegalState(format!("no registrations for {}", lease.key))
        })?;
        if bucket.providers.remove(&lease.id).is_none() {
            return Err(TripleError::IllegalState(format!(
                "lease {} already released",
                lease.id
            )));
        }
        debug!(key = %lease.key, endpoint = %lease.endpoint, "provider unregistered");
        Self::notify(bucket);
        if bucket.is_empty() {
            state.remove(&lease.key.interface);
        }
        Ok(())
    }

    fn subscribe(&self, key: &ServiceKey, listener: Listener) -> Result<Subscription> {
        let id = self.next_id();
        let snapshot = {
            let mut state = self.state.lock().expect("registry state poisoned");
            let bucket = state.entry(key.interface.clone()).or_default();
            bucket.listeners.insert(id, Arc::clone(&listener));
            bucket.snapshot()
        };
        // Initial snapshot outside the lock: a listener may re-enter the
        // registry.
        listener(snapshot);
        Ok(Subscription {
            id,
            key: key.clone(),
        })
    }

    fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let mut state = self.state.lock().expect("registry state poisoned");
        if let Some(bucket) = state.get_mut(&subscription.key.interface) {
            bucket.listeners.remove(&subscription.id);
            if bucket.is_empty() {
                state.remove(&subscription.key.interface);
            }
        }
        Ok(())
    }
}
