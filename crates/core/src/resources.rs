//! Source and Target custom resources.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{self, Entry};
use crate::ObjectKey;

/// Desired state carried by a Source: what should show up on the correlated Target.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "sync.tandem.dev", version = "v1alpha1", kind = "Source", namespaced)]
#[kube(status = "SourceStatus")]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub additional_info: Vec<String>,
}

/// Append-only audit trail written by the synchronizer.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SourceStatus {
    /// Append one ledger entry and hand the status back for persisting.
    pub fn record(self, entry: Entry<'_>, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self { conditions: conditions::append(self.conditions, entry, now) }
    }
}

/// Targets carry no desired state of their own.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "sync.tandem.dev", version = "v1alpha1", kind = "Target", namespaced)]
#[kube(status = "TargetStatus")]
pub struct TargetSpec {}

/// Projection of `SourceSpec` into the target cluster.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_info: Vec<String>,
    /// Reserved for other producers; the synchronizer never writes here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Source {
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    /// Target status this Source projects to.
    pub fn projected_status(&self) -> TargetStatus {
        TargetStatus {
            message: self.spec.message.clone(),
            additional_info: self.spec.additional_info.clone(),
            conditions: Vec::new(),
        }
    }
}

impl Target {
    /// Fresh Target correlated with `key`, carrying `status`.
    pub fn projected(key: &ObjectKey, status: TargetStatus) -> Self {
        Target {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                ..ObjectMeta::default()
            },
            spec: TargetSpec {},
            status: Some(status),
        }
    }

    /// Overwrite the projected fields, leaving reserved conditions alone.
    pub fn apply_projection(&mut self, projected: TargetStatus) {
        let status = self.status.get_or_insert_with(TargetStatus::default);
        status.message = projected.message;
        status.additional_info = projected.additional_info;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{CustomResourceExt, Resource};

    #[test]
    fn kinds_share_group_and_version() {
        assert_eq!(Source::kind(&()), "Source");
        assert_eq!(Target::kind(&()), "Target");
        assert_eq!(Source::api_version(&()), "sync.tandem.dev/v1alpha1");
        assert_eq!(Source::api_version(&()), Target::api_version(&()));
    }

    #[test]
    fn crds_are_namespaced_with_status_subresource() {
        for crd in [Source::crd(), Target::crd()] {
            assert_eq!(crd.spec.scope, "Namespaced");
            let version = &crd.spec.versions[0];
            assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
        }
    }

    #[test]
    fn source_spec_uses_camel_case_on_the_wire() {
        let raw = serde_json::json!({
            "apiVersion": "sync.tandem.dev/v1alpha1",
            "kind": "Source",
            "metadata": { "name": "a", "namespace": "ns" },
            "spec": { "message": "hello", "additionalInfo": ["x", "y"] }
        });
        let src: Source = serde_json::from_value(raw).unwrap();
        assert_eq!(src.spec.message, "hello");
        assert_eq!(src.spec.additional_info, vec!["x", "y"]);
        assert!(src.conditions().is_empty());
    }

    #[test]
    fn projection_keeps_reserved_target_conditions() {
        let key = ObjectKey::new("ns", "a");
        let mut target = Target::projected(&key, TargetStatus::default());
        let reserved = conditions::append(
            Vec::new(),
            Entry::new("Ready", crate::ConditionStatus::Unknown, "External", "set elsewhere"),
            chrono::Utc::now(),
        );
        target.status.as_mut().unwrap().conditions = reserved.clone();

        let mut src = Source::new("a", SourceSpec { message: "bye".into(), additional_info: vec!["x".into()] });
        src.metadata.namespace = Some("ns".into());
        target.apply_projection(src.projected_status());

        let status = target.status.unwrap();
        assert_eq!(status.message, "bye");
        assert_eq!(status.additional_info, vec!["x"]);
        assert_eq!(status.conditions, reserved);
    }
}
