//! Pluggable service registry.
//!
//! A registry answers two questions: "where do I announce myself?"
//! (register/unregister, leased) and "who provides this service?"
//! (subscribe/unsubscribe, snapshot-based). Listeners always receive the
//! full current address set, never deltas, so a missed notification is
//! repaired by the next one.

pub(crate) mod memory;
#[cfg(feature = "zookeeper")]
pub(crate) mod zookeeper;

pub use memory::MemoryRegistry;
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZookeeperRegistry;

use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::Result;

/// Snapshot callback invoked on every membership change of a subscribed
/// service.
pub type Listener = Arc<dyn Fn(Vec<Endpoint>) + Send + Sync>;

/// Identity of a service in the registry: interface name plus optional
/// group and version qualifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub interface: String,
    pub group: Option<String>,
    pub version: Option<String>,
}

impl ServiceKey {
    pub fn new(interface: impl Into<String>) -> ServiceKey {
        ServiceKey {
            interface: interface.into(),
            group: None,
            version: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> ServiceKey {
        self.group = Some(group.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> ServiceKey {
        self.version = Some(version.into());
        self
    }

    /// Canonical string form, used for display and diagnostics.
    /// Registries bucket providers by [`interface`](ServiceKey::interface)
    /// alone; the qualifiers travel on the endpoints.
    pub fn canonical(&self) -> String {
        let mut key = self.interface.clone();
        let mut sep = '?';
        if let Some(group) = &self.group {
            key.push(sep);
            key.push_str("group=");
            key.push_str(group);
            sep = '&';
        }
        if let Some(version) = &self.version {
            key.push(sep);
            key.push_str("version=");
            key.push_str(version);
        }
        key
    }

    /// Group/version filter applied to endpoints before selection. An
    /// endpoint with no qualifier matches any key; a qualified endpoint
    /// must match exactly.
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        let group_ok = match (&self.group, &endpoint.metadata.group) {
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let version_ok = match (&self.version, &endpoint.metadata.version) {
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
            (None, _) => true,
        };
        group_ok && version_ok
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Handle for one registered provider address. Returned by
/// [`Registry::register`]; pass it back to unregister.
#[derive(Debug)]
pub struct Lease {
    pub(crate) id: u64,
    pub(crate) key: ServiceKey,
    pub(crate) endpoint: Endpoint,
}

impl Lease {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }
}

/// Handle for one active subscription.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) key: ServiceKey,
}

impl Subscription {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }
}

/// The registry abstraction. Implementations must deliver an initial
/// snapshot to a new subscriber and a fresh snapshot on every change;
/// subscriptions to the same interface are independent (refcounted per
/// interface). Snapshots carry the interface's whole provider set: the
/// key's group/version qualifiers ride on the endpoints, and filtering
/// them is the subscriber's job (the directory does it before
/// selection).
pub trait Registry: Send + Sync {
    /// Announce a provider address under the key's interface. The
    /// address stays visible until the lease is released or the registry
    /// connection expires.
    fn register(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<Lease>;

    fn unregister(&self, lease: Lease) -> Result<()>;

    /// Watch the provider set of an interface. The listener is called
    /// with the current set before this returns.
    fn subscribe(&self, key: &ServiceKey, listener: Listener) -> Result<Subscription>;

    fn unsubscribe(&self, subscription: Subscription) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointMetadata;

    #[test]
    fn canonical_forms() {
        let key = ServiceKey::new("org.example.Hello");
        assert_eq!(key.canonical(), "org.example.Hello");
        let key = key.with_group("blue");
        assert_eq!(key.canonical(), "org.example.Hello?group=blue");
        let key = key.with_version("2.0");
        assert_eq!(key.canonical(), "org.example.Hello?group=blue&version=2.0");
        let only_version = ServiceKey::new("svc").with_version("1");
        assert_eq!(only_version.canonical(), "svc?version=1");
    }

    #[test]
    fn matching_respects_group_and_version() {
        let key = ServiceKey::new("svc").with_group("g").with_version("1.0");
        let mut endpoint = Endpoint::new("h", 1).with_metadata(EndpointMetadata {
            group: Some("g".into()),
            version: Some("1.0".into()),
            ..EndpointMetadata::default()
        });
        assert!(key.matches(&endpoint));
        endpoint.metadata.version = Some("2.0".into());
        assert!(!key.matches(&endpoint));
        endpoint.metadata.version = None;
        assert!(!key.matches(&endpoint));

        let open_key = ServiceKey::new("svc");
        assert!(open_key.matches(&endpoint));
    }
}
