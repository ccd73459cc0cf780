//! The narrow capability the reconcilers need from a cluster: get, create, status update.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, PostParams},
    core::object::HasStatus,
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tandem_core::{ObjectKey, StoreError};
use tracing::debug;

/// Typed access to one kind in one cluster.
///
/// Writes return the object as persisted, carrying the new `resourceVersion`; callers that
/// write the same object twice must continue from the returned value.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace only the status of `obj`. Fails with `Conflict` when `obj` is stale.
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;
}

/// `ObjectStore` backed by a kube-rs client.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self { client, _kind: PhantomData }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn key_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Rejected(format!("{} is missing metadata.name or metadata.namespace", K::kind(&()))))
}

/// Map a kube error onto the store taxonomy.
pub fn classify(err: kube::Error, kind: &str, key: &ObjectKey) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound { kind: kind.to_string(), key: key.clone() },
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists { kind: kind.to_string(), key: key.clone() },
            409 => StoreError::Conflict { kind: kind.to_string(), key: key.clone(), message: resp.message },
            429 | 500..=599 => StoreError::Transient(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
            _ => StoreError::Rejected(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        },
        kube::Error::SerdeError(e) => StoreError::Rejected(format!("decoding {kind} {key}: {e}")),
        other => StoreError::Transient(other.to_string()),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + HasStatus
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::Status: Clone + Send + Sync,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        metrics::counter!("tandem_store_calls_total", 1u64, "op" => "get");
        self.api(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| classify(e, &K::kind(&()), key))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        metrics::counter!("tandem_store_calls_total", 1u64, "op" => "create");
        let key = key_of(obj)?;
        let created = self
            .api(&key.namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &K::kind(&()), &key))?;
        // The API server drops status on create for kinds with a status subresource.
        match obj.status() {
            Some(status) => {
                debug!(kind = %K::kind(&()), key = %key, "writing initial status after create");
                let mut next = created;
                *next.status_mut() = Some(status.clone());
                self.update_status(&next).await
            }
            None => Ok(created),
        }
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        metrics::counter!("tandem_store_calls_total", 1u64, "op" => "update_status");
        let key = key_of(obj)?;
        let data = serde_json::to_vec(obj).map_err(|e| StoreError::Rejected(format!("encoding {} {}: {}", K::kind(&()), key, e)))?;
        self.api(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| classify(e, &K::kind(&()), &key))
    }
}
