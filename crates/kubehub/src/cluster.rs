//! Cluster set: the injectable registry mapping symbolic cluster names to typed clients.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::Client;
use rustc_hash::FxHashMap;
use tandem_core::{ResolveError, Source, Target};
use tracing::info;

use crate::store::{KubeStore, ObjectStore};

/// Typed handle on one cluster. Each cluster serves the kinds of its role only.
#[derive(Clone)]
pub struct ClusterClient {
    name: String,
    sources: Option<Arc<dyn ObjectStore<Source>>>,
    targets: Option<Arc<dyn ObjectStore<Target>>>,
}

impl ClusterClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), sources: None, targets: None }
    }

    pub fn with_sources(mut self, store: Arc<dyn ObjectStore<Source>>) -> Self {
        self.sources = Some(store);
        self
    }

    pub fn with_targets(mut self, store: Arc<dyn ObjectStore<Target>>) -> Self {
        self.targets = Some(store);
        self
    }

    /// Source-role cluster backed by the kube API.
    pub fn kube_sources(name: impl Into<String>, client: Client) -> Self {
        Self::new(name).with_sources(Arc::new(KubeStore::<Source>::new(client)))
    }

    /// Target-role cluster backed by the kube API.
    pub fn kube_targets(name: impl Into<String>, client: Client) -> Self {
        Self::new(name).with_targets(Arc::new(KubeStore::<Target>::new(client)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> Result<Arc<dyn ObjectStore<Source>>, ResolveError> {
        self.sources
            .clone()
            .ok_or_else(|| ResolveError::KindNotServed { cluster: self.name.clone(), kind: "Source" })
    }

    pub fn targets(&self) -> Result<Arc<dyn ObjectStore<Target>>, ResolveError> {
        self.targets
            .clone()
            .ok_or_else(|| ResolveError::KindNotServed { cluster: self.name.clone(), kind: "Target" })
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("name", &self.name)
            .field("sources", &self.sources.is_some())
            .field("targets", &self.targets.is_some())
            .finish()
    }
}

/// Resolve a cluster name to a client. Lookup only; no side effects.
pub trait ClusterResolver: Send + Sync {
    fn resolve(&self, cluster: &str) -> Result<Arc<ClusterClient>, ResolveError>;
}

#[derive(Clone)]
struct Member {
    client: Arc<ClusterClient>,
    ready: bool,
}

/// Runtime-mutable set of clusters. Readers see a consistent snapshot without locking.
#[derive(Default)]
pub struct ClusterSet {
    members: ArcSwap<FxHashMap<String, Member>>,
}

impl ClusterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a cluster that is ready to serve.
    pub fn insert(&self, client: ClusterClient) {
        self.put(client, true);
    }

    /// Register a cluster whose caches are still warming up; resolving it fails with `NotReady`.
    pub fn insert_pending(&self, client: ClusterClient) {
        self.put(client, false);
    }

    fn put(&self, client: ClusterClient, ready: bool) {
        let name = client.name().to_string();
        let client = Arc::new(client);
        self.members.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(name.clone(), Member { client: Arc::clone(&client), ready });
            next
        });
        info!(cluster = %name, ready, "cluster registered");
    }

    /// Flip a pending cluster to ready. Returns false when the name is unknown.
    pub fn mark_ready(&self, name: &str) -> bool {
        let mut found = false;
        self.members.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            found = match next.get_mut(name) {
                Some(m) => {
                    m.ready = true;
                    true
                }
                None => false,
            };
            next
        });
        found
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut found = false;
        self.members.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            found = next.remove(name).is_some();
            next
        });
        if found {
            info!(cluster = %name, "cluster removed");
        }
        found
    }

    /// Registered cluster names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClusterResolver for ClusterSet {
    fn resolve(&self, cluster: &str) -> Result<Arc<ClusterClient>, ResolveError> {
        match self.members.load().get(cluster) {
            Some(m) if m.ready => Ok(Arc::clone(&m.client)),
            Some(_) => Err(ResolveError::NotReady(cluster.to_string())),
            None => Err(ResolveError::UnknownCluster(cluster.to_string())),
        }
    }
}
