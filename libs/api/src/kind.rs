//! The static table of resource kinds and the [`Resource`] trait that binds a
//! Rust type to its kind.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ApiError, ObjectKey, ObjectMeta};

/// Every record kind known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Registry,
    ScanJob,
    Sbom,
    VulnerabilityReport,
    VexHub,
}

/// Static properties of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub kind: ResourceKind,
    /// Canonical name used in logs and owner references.
    pub name: &'static str,
    /// Whether objects of this kind live in a namespace.
    pub namespaced: bool,
    /// Whether the kind has a separately updatable `status` field.
    pub status_subresource: bool,
}

const KINDS: [KindInfo; 5] = [
    KindInfo {
        kind: ResourceKind::Registry,
        name: "Registry",
        namespaced: true,
        status_subresource: false,
    },
    KindInfo {
        kind: ResourceKind::ScanJob,
        name: "ScanJob",
        namespaced: true,
        status_subresource: true,
    },
    KindInfo {
        kind: ResourceKind::Sbom,
        name: "SBOM",
        namespaced: true,
        status_subresource: false,
    },
    KindInfo {
        kind: ResourceKind::VulnerabilityReport,
        name: "VulnerabilityReport",
        namespaced: true,
        status_subresource: false,
    },
    KindInfo {
        kind: ResourceKind::VexHub,
        name: "VEXHub",
        namespaced: false,
        status_subresource: false,
    },
];

impl ResourceKind {
    /// All kinds, in table order.
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Registry,
        ResourceKind::ScanJob,
        ResourceKind::Sbom,
        ResourceKind::VulnerabilityReport,
        ResourceKind::VexHub,
    ];

    /// Static properties of this kind.
    pub fn info(&self) -> &'static KindInfo {
        &KINDS[*self as usize]
    }

    pub fn as_str(&self) -> &'static str {
        self.info().name
    }

    pub fn is_namespaced(&self) -> bool {
        self.info().namespaced
    }

    pub fn has_status(&self) -> bool {
        self.info().status_subresource
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KINDS
            .iter()
            .find(|info| info.name.eq_ignore_ascii_case(s))
            .map(|info| info.kind)
            .ok_or_else(|| ApiError::UnknownKind(s.to_string()))
    }
}

/// A typed record stored under a [`ResourceKind`].
///
/// The serde implementation is the record's codec: the store persists the
/// JSON form and decodes it back through this trait.
pub trait Resource:
    Serialize + DeserializeOwned + Clone + Default + Send + Sync + std::fmt::Debug + 'static
{
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Namespace/name key of this object.
    fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey::new(&meta.namespace, &meta.name)
    }

    /// Creates an empty object with the given key.
    fn with_key(key: &ObjectKey) -> Self {
        let mut obj = Self::default();
        let meta = obj.metadata_mut();
        meta.name = key.name.clone();
        meta.namespace = key.namespace.clone();
        obj
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl $crate::Resource for $ty {
            const KIND: $crate::ResourceKind = $kind;

            fn metadata(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;
