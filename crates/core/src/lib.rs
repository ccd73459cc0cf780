//! Tandem core types: resource kinds, object keys, the condition ledger and error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod error;
pub mod resources;

pub use conditions::{ConditionStatus, ConditionType, Entry};
pub use error::{ResolveError, StoreError};
pub use resources::{Source, SourceSpec, SourceStatus, Target, TargetSpec, TargetStatus};

/// Well-known cluster name for the cluster holding `Source` objects.
pub const SOURCE_CLUSTER: &str = "source";
/// Well-known cluster name for the cluster holding `Target` objects.
pub const TARGET_CLUSTER: &str = "target";

/// Namespaced identity of an object. Sources and Targets correlate across clusters on this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of a namespaced object, if its metadata carries both name and namespace.
    pub fn of<K: kube::Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self { namespace: meta.namespace.clone()?, name: meta.name.clone()? })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A unit of work for a reconciler: which cluster the event came from and which object changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub cluster: String,
    pub key: ObjectKey,
}

impl ReconcileRequest {
    pub fn new(cluster: impl Into<String>, key: ObjectKey) -> Self {
        Self { cluster: cluster.into(), key }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_as_namespace_slash_name() {
        let key = ObjectKey::new("ns", "a");
        assert_eq!(key.to_string(), "ns/a");
        let req = ReconcileRequest::new(SOURCE_CLUSTER, key);
        assert_eq!(req.to_string(), "source:ns/a");
    }

    #[test]
    fn key_of_requires_namespace() {
        let mut src = Source::new("a", SourceSpec::default());
        assert!(ObjectKey::of(&src).is_none());
        src.metadata.namespace = Some("ns".into());
        assert_eq!(ObjectKey::of(&src), Some(ObjectKey::new("ns", "a")));
    }
}
