//! Tandem store: an in-RAM stand-in for one cluster's object store.
//!
//! Behaves like the API server where the reconcilers can observe it: `resourceVersion`
//! compare-and-swap on status writes, `AlreadyExists` on duplicate creates, uid/generation
//! assignment. Faults can be queued per operation to exercise error paths.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{core::object::HasStatus, Resource};
use rustc_hash::FxHashMap;
use tandem_core::{ObjectKey, StoreError};
use tandem_kubehub::ObjectStore;
use tracing::debug;
use uuid::Uuid;

/// Store operation, used for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    UpdateStatus,
}

/// Calls served so far, including the ones that failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub create: usize,
    pub update_status: usize,
}

struct Inner<K> {
    objects: FxHashMap<ObjectKey, K>,
    last_rv: u64,
    faults: VecDeque<(Op, StoreError)>,
    calls: CallCounts,
}

/// In-memory `ObjectStore` for a single kind.
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: FxHashMap::default(),
                last_rv: 0,
                faults: VecDeque::new(),
                calls: CallCounts::default(),
            }),
        }
    }
}

impl<K> Inner<K> {
    fn next_rv(&mut self) -> String {
        self.last_rv += 1;
        self.last_rv.to_string()
    }

    /// Count the call and pop the first queued fault for `op`, if any.
    fn enter(&mut self, op: Op) -> Result<(), StoreError> {
        match op {
            Op::Get => self.calls.get += 1,
            Op::Create => self.calls.create += 1,
            Op::UpdateStatus => self.calls.update_status += 1,
        }
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + HasStatus + Clone,
    K::Status: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn key_of(obj: &K) -> Result<ObjectKey, StoreError> {
        ObjectKey::of(obj)
            .ok_or_else(|| StoreError::Rejected(format!("{} is missing metadata.name or metadata.namespace", Self::kind())))
    }

    /// Write `obj` as an external actor would (create or full replace), returning the stored copy.
    pub fn put(&self, mut obj: K) -> Result<K, StoreError> {
        let key = Self::key_of(&obj)?;
        let mut inner = self.lock();
        let rv = inner.next_rv();
        let prev = inner.objects.get(&key).map(|o| o.meta().clone());
        let meta = obj.meta_mut();
        match prev {
            Some(prev) => {
                meta.uid = prev.uid;
                meta.creation_timestamp = prev.creation_timestamp;
                meta.generation = Some(prev.generation.unwrap_or(0) + 1);
            }
            None => {
                meta.uid = Some(Uuid::new_v4().to_string());
                meta.creation_timestamp = Some(Time(chrono::Utc::now()));
                meta.generation = Some(1);
            }
        }
        meta.resource_version = Some(rv);
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Mutate a stored object in place as an external actor; bumps generation and resourceVersion.
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> Option<K> {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        let obj = inner.objects.get_mut(key)?;
        f(obj);
        let meta = obj.meta_mut();
        meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        meta.resource_version = Some(rv);
        Some(obj.clone())
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.remove(key)
    }

    /// Read without counting a call or consuming faults.
    pub fn peek(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next call of `op` with `err`. Faults for the same op queue up in order.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.lock().faults.push_back((op, err));
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + HasStatus + Clone + Send + Sync,
    K::Status: Clone + Send + Sync,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let mut inner = self.lock();
        inner.enter(Op::Get)?;
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: Self::kind(), key: key.clone() })
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let mut inner = self.lock();
        inner.enter(Op::Create)?;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: Self::kind(), key });
        }
        let rv = inner.next_rv();
        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.generation = Some(1);
        meta.resource_version = Some(rv);
        debug!(kind = %Self::kind(), key = %key, "created");
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let mut inner = self.lock();
        inner.enter(Op::UpdateStatus)?;
        let rv = inner.next_rv();
        let kind = Self::kind();
        let stored = inner
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound { kind: kind.clone(), key: key.clone() })?;
        let incoming_rv = obj.meta().resource_version.as_deref();
        let current_rv = stored.meta().resource_version.as_deref();
        if incoming_rv.is_some() && incoming_rv != current_rv {
            return Err(StoreError::Conflict {
                kind,
                key,
                message: format!(
                    "the object has been modified (have {}, stored {})",
                    incoming_rv.unwrap_or_default(),
                    current_rv.unwrap_or_default()
                ),
            });
        }
        // Status subresource semantics: only status moves, spec and metadata stay as stored.
        *stored.status_mut() = obj.status().cloned();
        stored.meta_mut().resource_version = Some(rv);
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{Source, SourceSpec, SourceStatus, Target, TargetStatus};

    fn source(ns: &str, name: &str, message: &str) -> Source {
        let mut s = Source::new(name, SourceSpec { message: message.into(), additional_info: vec![] });
        s.metadata.namespace = Some(ns.into());
        s
    }

    #[tokio::test]
    async fn status_write_with_stale_version_conflicts() {
        let store = MemoryStore::<Source>::new();
        let key = ObjectKey::new("ns", "a");
        store.put(source("ns", "a", "hello")).unwrap();

        let mut stale = store.get(&key).await.unwrap();
        store.modify(&key, |s| s.spec.message = "newer".into());

        stale.status = Some(SourceStatus::default());
        let err = store.update_status(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let fresh = store.get(&key).await.unwrap();
        assert_eq!(fresh.spec.message, "newer");
        assert!(fresh.status.is_none());
    }

    #[tokio::test]
    async fn status_write_leaves_spec_alone() {
        let store = MemoryStore::<Source>::new();
        let key = ObjectKey::new("ns", "a");
        store.put(source("ns", "a", "hello")).unwrap();

        let mut obj = store.get(&key).await.unwrap();
        obj.spec.message = "ignored".into();
        obj.status = Some(SourceStatus::default());
        let written = store.update_status(&obj).await.unwrap();
        assert_eq!(written.spec.message, "hello");
        assert_ne!(written.metadata.resource_version, obj.metadata.resource_version);
        assert_eq!(store.peek(&key).unwrap().status, Some(SourceStatus::default()));
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryStore::<Target>::new();
        let key = ObjectKey::new("ns", "a");
        let t = Target::projected(&key, TargetStatus { message: "m".into(), ..Default::default() });
        let created = store.create(&t).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.status.unwrap().message, "m");
        assert_eq!(
            store.create(&t).await.unwrap_err(),
            StoreError::AlreadyExists { kind: "Target".into(), key }
        );
        assert_eq!(store.calls().create, 2);
    }

    #[tokio::test]
    async fn faults_fire_once_per_queued_entry() {
        let store = MemoryStore::<Source>::new();
        let key = ObjectKey::new("ns", "a");
        store.put(source("ns", "a", "hello")).unwrap();
        store.fail_next(Op::Get, StoreError::Transient("connection reset".into()));

        assert_eq!(store.get(&key).await.unwrap_err(), StoreError::Transient("connection reset".into()));
        assert!(store.get(&key).await.is_ok());
        assert_eq!(store.calls().get, 2);
    }

    #[test]
    fn put_keeps_uid_and_bumps_generation() {
        let store = MemoryStore::<Source>::new();
        let first = store.put(source("ns", "a", "one")).unwrap();
        let second = store.put(source("ns", "a", "two")).unwrap();
        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert_eq!(second.metadata.generation, Some(2));
        assert_eq!(store.len(), 1);
    }
}
