//! Object metadata shared by every resource kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApiError, ObjectUid, Resource, ResourceKind};

// =============================================================================
// Labels
// =============================================================================

/// Correlates a record with the ScanJob that produced it (by name).
pub const LABEL_SCAN_JOB: &str = "scanjob";

/// Correlates a record with the ScanJob that produced it (by uid).
pub const LABEL_SCAN_JOB_UID: &str = "scanjob-uid";

pub const LABEL_MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_MANAGED_BY_VALUE: &str = "vscan-controller";
pub const LABEL_PART_OF_KEY: &str = "app.kubernetes.io/part-of";
pub const LABEL_PART_OF_VALUE: &str = "vscan";

// =============================================================================
// Keys
// =============================================================================

/// Namespace/name pair addressing one object of a given kind.
///
/// Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Structural parent link used for cascading deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: ResourceKind,
    pub name: String,
    pub uid: ObjectUid,
    /// At most one owner reference per object may be the controller.
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

/// Metadata header carried by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Assigned by the store on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<ObjectUid>,

    /// Version used for optimistic concurrency; bumped on every write.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// The controlling owner, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// Returns true if `uid` appears among the owner references.
    pub fn is_owned_by(&self, uid: &ObjectUid) -> bool {
        self.owner_references.iter().any(|r| &r.uid == uid)
    }

    /// Makes `owner` the controlling owner of this object.
    ///
    /// Re-setting the same owner is a no-op. A different existing
    /// controller is an error.
    pub fn set_controller_reference<R: Resource>(&mut self, owner: &R) -> Result<(), ApiError> {
        let owner_meta = owner.metadata();
        let uid = owner_meta.uid.ok_or_else(|| ApiError::MissingUid {
            kind: R::KIND,
            name: owner_meta.name.clone(),
        })?;

        if R::KIND.is_namespaced() && owner_meta.namespace != self.namespace {
            return Err(ApiError::CrossNamespaceOwner {
                owner: owner_meta.namespace.clone(),
                dependent: self.namespace.clone(),
            });
        }

        if let Some(existing) = self.controller_ref() {
            if existing.uid != uid {
                return Err(ApiError::AlreadyOwned {
                    name: self.name.clone(),
                    kind: existing.kind,
                    owner: existing.name.clone(),
                });
            }
        }

        let reference = OwnerReference {
            kind: R::KIND,
            name: owner_meta.name.clone(),
            uid,
            controller: true,
            block_owner_deletion: true,
        };

        match self.owner_references.iter_mut().find(|r| r.uid == uid) {
            Some(slot) => *slot = reference,
            None => self.owner_references.push(reference),
        }

        Ok(())
    }
}

// =============================================================================
// Selectors
// =============================================================================

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `key=value` requirement.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Sbom, VulnerabilityReport};
    use proptest::prelude::*;

    fn persisted_sbom(name: &str) -> Sbom {
        let mut sbom = Sbom::default();
        sbom.metadata = ObjectMeta::new("default", name);
        sbom.metadata.uid = Some(ObjectUid::new());
        sbom
    }

    #[test]
    fn test_set_controller_reference() {
        let sbom = persisted_sbom("sbom-a");
        let mut report = VulnerabilityReport::default();
        report.metadata = ObjectMeta::new("default", "sbom-a");

        report.metadata.set_controller_reference(&sbom).unwrap();
        // Idempotent for the same owner.
        report.metadata.set_controller_reference(&sbom).unwrap();

        assert_eq!(report.metadata.owner_references.len(), 1);
        let owner = report.metadata.controller_ref().unwrap();
        assert_eq!(owner.kind, ResourceKind::Sbom);
        assert_eq!(Some(owner.uid), sbom.metadata.uid);
    }

    #[test]
    fn test_set_controller_reference_rejects_second_controller() {
        let mut report = VulnerabilityReport::default();
        report.metadata = ObjectMeta::new("default", "sbom-a");
        report
            .metadata
            .set_controller_reference(&persisted_sbom("sbom-a"))
            .unwrap();

        let err = report
            .metadata
            .set_controller_reference(&persisted_sbom("sbom-b"))
            .unwrap_err();
        assert!(matches!(err, ApiError::AlreadyOwned { .. }));
    }

    #[test]
    fn test_set_controller_reference_requires_uid() {
        let mut sbom = persisted_sbom("sbom-a");
        sbom.metadata.uid = None;
        let mut report = VulnerabilityReport::default();
        report.metadata = ObjectMeta::new("default", "sbom-a");

        let err = report.metadata.set_controller_reference(&sbom).unwrap_err();
        assert!(matches!(err, ApiError::MissingUid { .. }));
    }

    #[test]
    fn test_set_controller_reference_rejects_cross_namespace() {
        let sbom = persisted_sbom("sbom-a");
        let mut report = VulnerabilityReport::default();
        report.metadata = ObjectMeta::new("other", "sbom-a");

        let err = report.metadata.set_controller_reference(&sbom).unwrap_err();
        assert!(matches!(err, ApiError::CrossNamespaceOwner { .. }));
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("default", "job").to_string(), "default/job");
        assert_eq!(ObjectKey::cluster("hub").to_string(), "hub");
    }

    proptest! {
        #[test]
        fn prop_selector_matches_its_own_labels(
            labels in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..6)
        ) {
            let selector = labels
                .iter()
                .fold(LabelSelector::new(), |s, (k, v)| s.with_label(k.clone(), v.clone()));
            prop_assert!(selector.matches(&labels));
            prop_assert!(LabelSelector::new().matches(&labels));
        }

        #[test]
        fn prop_selector_rejects_changed_value(
            key in "[a-z]{1,8}",
            value in "[a-z]{1,8}",
        ) {
            let selector = LabelSelector::new().with_label(key.clone(), value.clone());
            let mut labels = BTreeMap::new();
            labels.insert(key, format!("{value}-other"));
            prop_assert!(!selector.matches(&labels));
        }
    }
}
