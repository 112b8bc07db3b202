//! Zookeeper-backed registry.
//!
//! Wire layout: each provider is an ephemeral znode at
//! `/dubbo/<interface>/providers/<url-encoded endpoint URL>`, where the
//! endpoint URL embeds host, port, and metadata as query parameters.
//! Every `getChildren` carries a watch; every watch fire triggers a
//! refetch and a full-snapshot delivery. On session expiry the client
//! reconnects, re-creates every local lease, and re-arms every watch, so
//! listeners always converge on the live membership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zookeeper_client as zk;

use crate::endpoint::Endpoint;
use crate::error::{Result, TripleError};
use crate::registry::{Lease, Listener, Registry, ServiceKey, Subscription};
use crate::runtime::Driver;
use crate::url::{decode_znode_name, encode_znode_name, endpoint_from_url, endpoint_to_url};

const ROOT: &str = "/dubbo";
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

fn zk_error(context: &str, err: impl std::fmt::Display) -> TripleError {
    TripleError::Transport(format!("zookeeper {context}: {err}"))
}

fn providers_path(interface: &str) -> String {
    format!("{ROOT}/{interface}/providers")
}

struct WatchState {
    listeners: HashMap<u64, (ServiceKey, Listener)>,
}

struct ZkInner {
    hosts: String,
    client: tokio::sync::Mutex<zk::Client>,
    /// Ephemeral nodes owned by this process, re-created after expiry.
    leases: Mutex<HashMap<u64, (ServiceKey, String)>>,
    /// One watch loop per provider path; listeners fan out from it.
    watches: Mutex<HashMap<String, Arc<Mutex<WatchState>>>>,
    shutdown: CancellationToken,
}

impl ZkInner {
    async fn connect(hosts: &str) -> Result<zk::Client> {
        zk::Client::connect(hosts)
            .await
            .map_err(|e| zk_error("connect", e))
    }

    /// Create a persistent chain of parents, tolerating existing nodes.
    async fn ensure_parents(client: &zk::Client, path: &str) -> Result<()> {
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
            match client.create(&prefix, &[], &options).await {
                Ok(_) => {}
                Err(zk::Error::NodeExists) => {}
                Err(err) => return Err(zk_error("create parent", err)),
            }
        }
        Ok(())
    }

    async fn create_ephemeral(client: &zk::Client, path: &str) -> Result<()> {
        let options = zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all());
        match client.create(path, &[], &options).await {
            Ok(_) => Ok(()),
            // Left over from a previous session that has not yet lapsed.
            Err(zk::Error::NodeExists) => Ok(()),
            Err(err) => Err(zk_error("create provider node", err)),
        }
    }

    async fn fetch_children(client: &zk::Client, path: &str) -> Result<(Vec<String>, zk::OneshotWatcher)> {
        client
            .get_and_watch_children(path)
            .await
            .map_err(|e| zk_error("get children", e))
    }

    fn decode_snapshot(children: &[String]) -> Vec<Endpoint> {
        children
            .iter()
            .filter_map(|name| {
                let url = decode_znode_name(name).ok()?;
                match endpoint_from_url(&url) {
                    Ok(endpoint) => Some(endpoint),
                    Err(err) => {
                        warn!(%name, %err, "skipping undecodable provider node");
                        None
                    }
                }
            })
            .collect()
    }

    fn deliver(state: &Arc<Mutex<WatchState>>, endpoints: &[Endpoint]) {
        let listeners: Vec<Listener> = {
            let state = state.lock().expect("watch state poisoned");
            state.listeners.values().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(endpoints.to_vec());
        }
    }

    /// One subscription loop: fetch + watch, deliver, wait, repeat.
    /// Fetch failures back off and retry, which also re-arms the watch
    /// after a session is re-established.
    async fn watch_loop(self: Arc<Self>, path: String, state: Arc<Mutex<WatchState>>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if state.lock().expect("watch state poisoned").listeners.is_empty() {
                // Last subscriber left; drop the loop.
                self.watches.lock().expect("watch table poisoned").remove(&path);
                return;
            }
            let fetched = {
                let client = self.client.lock().await;
                Self::fetch_children(&client, &path).await
            };
            match fetched {
                Ok((children, watcher)) => {
                    let endpoints = Self::decode_snapshot(&children);
                    debug!(%path, providers = endpoints.len(), "snapshot delivered");
                    Self::deliver(&state, &endpoints);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = watcher.changed() => {}
                    }
                }
                Err(err) => {
                    debug!(%path, %err, "children fetch failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Watch the session; on expiry reconnect and re-create every local
    /// lease. Watch loops recover on their own through fetch retries.
    async fn session_loop(self: Arc<Self>) {
        loop {
            let mut state_watcher = {
                let client = self.client.lock().await;
                client.state_watcher()
            };
            let lapsed = loop {
                let state = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    state = state_watcher.changed() => state,
                };
                if state.is_terminated() {
                    break state;
                }
            };
            warn!(?lapsed, "zookeeper session lapsed, reconnecting");
            loop {
                if self.shutdown.is_cancelled() {
                    return;
                }
                match Self::connect(&self.hosts).await {
                    Ok(fresh) => {
                        *self.client.lock().await = fresh;
                        if let Err(err) = self.restore_leases().await {
                            warn!(%err, "failed to restore leases, retrying");
                            tokio::time::sleep(RETRY_BACKOFF).await;
                            continue;
                        }
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "zookeeper reconnect failed, backing off");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
    }

    async fn restore_leases(&self) -> Result<()> {
        let paths: Vec<String> = {
            let leases = self.leases.lock().expect("lease table poisoned");
            leases.values().map(|(_, path)| path.clone()).collect()
        };
        let client = self.client.lock().await;
        for path in paths {
            if let Some(parent) = path.rsplit_once('/').map(|(p, _)| p.to_string()) {
                Self::ensure_parents(&client, &parent).await?;
            }
            Self::create_ephemeral(&client, &path).await?;
            debug!(%path, "lease restored");
        }
        Ok(())
    }
}

/// A [`Registry`] backed by a Zookeeper ensemble.
pub struct ZookeeperRegistry {
    driver: Arc<Driver>,
    inner: Arc<ZkInner>,
    next_id: AtomicU64,
}

impl ZookeeperRegistry {
    /// Connect to an ensemble. `hosts` may be a comma-separated list
    /// (`h1:2181,h2:2181,h3:2181`) and is forwarded verbatim.
    pub fn connect(hosts: &str, driver: Arc<Driver>) -> Result<Arc<ZookeeperRegistry>> {
        let hosts = hosts.to_string();
        let task_hosts = hosts.clone();
        let client = driver.run(async move { ZkInner::connect(&task_hosts).await })??;
        let inner = Arc::new(ZkInner {
            hosts,
            client: tokio::sync::Mutex::new(client),
            leases: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        driver.spawn(Arc::clone(&inner).session_loop());
        Ok(Arc::new(ZookeeperRegistry {
            driver,
            inner,
            next_id: AtomicU64::new(1),
        }))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Registry for ZookeeperRegistry {
    fn register(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<Lease> {
        let mut endpoint = endpoint.clone();
        // The key's qualifiers ride on the endpoint URL so that
        // subscribers can filter.
        if endpoint.metadata.group.is_none() {
            endpoint.metadata.group = key.group.clone();
        }
        if endpoint.metadata.version.is_none() {
            endpoint.metadata.version = key.version.clone();
        }
        let parent = providers_path(&key.interface);
        let node = format!("{parent}/{}", encode_znode_name(&endpoint_to_url(&endpoint)));
        let inner = Arc::clone(&self.inner);
        let task_parent = parent.clone();
        let task_node = node.clone();
        self.driver.run(async move {
            let client = inner.client.lock().await;
            ZkInner::ensure_parents(&client, &task_parent).await?;
            ZkInner::create_ephemeral(&client, &task_node).await
        })??;
        let id = self.next_id();
        self.inner
            .leases
            .lock()
            .expect("lease table poisoned")
            .insert(id, (key.clone(), node));
        Ok(Lease {
            id,
            key: key.clone(),
            endpoint,
        })
    }

    fn unregister(&self, lease: Lease) -> Result<()> {
        let removed = self
            .inner
            .leases
            .lock()
            .expect("lease table poisoned")
            .remove(&lease.id);
        let Some((_, path)) = removed else {
            return Err(TripleError::IllegalState(format!(
                "lease {} already released",
                lease.id
            )));
        };
        let inner = Arc::clone(&self.inner);
        self.driver.run(async move {
            let client = inner.client.lock().await;
            match client.delete(&path, None).await {
                Ok(()) => Ok(()),
                Err(zk::Error::NoNode) => Ok(()),
                Err(err) => Err(zk_error("delete provider node", err)),
            }
        })?
    }

    fn subscribe(&self, key: &ServiceKey, listener: Listener) -> Result<Subscription> {
        let id = self.next_id();
        let path = providers_path(&key.interface);
        let (state, spawn_loop) = {
            let mut watches = self.inner.watches.lock().expect("watch table poisoned");
            match watches.get(&path) {
                Some(state) => (Arc::clone(state), false),
                None => {
                    let state = Arc::new(Mutex::new(WatchState {
                        listeners: HashMap::new(),
                    }));
                    watches.insert(path.clone(), Arc::clone(&state));
                    (state, true)
                }
            }
        };
        state
            .lock()
            .expect("watch state poisoned")
            .listeners
            .insert(id, (key.clone(), Arc::clone(&listener)));
        // Hand the new subscriber the current membership before the watch
        // loop takes over.
        let inner = Arc::clone(&self.inner);
        let task_path = path.clone();
        let snapshot = self.driver.run(async move {
            let client = inner.client.lock().await;
            ZkInner::ensure_parents(&client, &task_path).await?;
            let (children, _watch) = ZkInner::fetch_children(&client, &task_path).await?;
            Ok::<_, TripleError>(ZkInner::decode_snapshot(&children))
        })??;
        listener(snapshot);
        if spawn_loop {
            self.driver
                .spawn(Arc::clone(&self.inner).watch_loop(path, Arc::clone(&state)));
        }
        Ok(Subscription {
            id,
            key: key.clone(),
        })
    }

    fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let path = providers_path(&subscription.key.interface);
        let watches = self.inner.watches.lock().expect("watch table poisoned");
        if let Some(state) = watches.get(&path) {
            state
                .lock()
                .expect("watch state poisoned")
                .listeners
                .remove(&subscription.id);
        }
        Ok(())
    }
}

impl Drop for ZookeeperRegistry {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
