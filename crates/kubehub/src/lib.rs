//! Tandem kubehub: typed cluster clients, the cluster set resolver and per-cluster watchers.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tandem_core::{ObjectKey, ReconcileRequest};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod cluster;
pub mod store;

pub use cluster::{ClusterClient, ClusterResolver, ClusterSet};
pub use store::{KubeStore, ObjectStore};

/// Build a client from an explicit kubeconfig file, using its current context.
pub async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("unable to load kubeconfig from {:?}", path))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("unable to create rest config from kubeconfig {:?}", path))?;
    Client::try_from(config).with_context(|| format!("unable to create client for kubeconfig {:?}", path))
}

/// List+watch `K` in one cluster and send a reconcile request per observed change.
///
/// `Deleted` events are dropped: a deleted object produces no further reconciliation.
/// Watch errors are logged and retried with the watcher's default backoff; the function
/// returns once the receiving side of `tx` goes away.
pub async fn watch_requests<K>(
    cluster: &str,
    client: Client,
    namespace: Option<&str>,
    tx: mpsc::Sender<ReconcileRequest>,
) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned + Send + 'static,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(cluster = %cluster, kind = %K::kind(&()), ns = ?namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        let objs = match ev {
            Ok(Event::Applied(o)) => vec![o],
            Ok(Event::Deleted(o)) => {
                debug!(cluster = %cluster, key = ?ObjectKey::of(&o), "dropping delete event");
                continue;
            }
            Ok(Event::Restarted(list)) => {
                debug!(cluster = %cluster, count = list.len(), "watch restart");
                list
            }
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "watch error; backing off");
                metrics::counter!("tandem_watch_errors_total", 1u64);
                continue;
            }
        };
        for o in objs.iter() {
            let Some(key) = ObjectKey::of(o) else { continue };
            if tx.send(ReconcileRequest::new(cluster, key)).await.is_err() {
                info!(cluster = %cluster, "request channel closed; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(cluster = %cluster, "watcher stream ended");
    Ok(())
}
