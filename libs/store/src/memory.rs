//! In-memory resource store.
//!
//! Used by the embedded dev mode and by tests. Honors the full store
//! contract: optimistic concurrency, watch events, status subresource and
//! owner-reference garbage collection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use vscan_api::{LabelSelector, ObjectKey, ObjectMeta, ObjectUid, ResourceKind};

use crate::{ResourceStore, StoreError, StoreResult, WatchEvent, WatchEventType};

/// Capacity of the watch broadcast channel.
const WATCH_CAPACITY: usize = 1024;

type Objects = BTreeMap<(ResourceKind, ObjectKey), Value>;

/// Versioned in-memory store.
pub struct MemoryStore {
    objects: RwLock<Objects>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
    /// Number of upcoming calls that fail with `Unavailable`.
    injected_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` calls fail as if the store were unreachable.
    pub fn inject_unavailable(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Number of stored objects of a kind.
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.read().keys().filter(|(k, _)| *k == kind).count()
    }

    fn read(&self) -> RwLockReadGuard<'_, Objects> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Objects> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> StoreResult<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, kind: ResourceKind, event_type: WatchEventType, object: Value) {
        // No receivers is not an error.
        let _ = self.events.send(WatchEvent {
            kind,
            event_type,
            object,
        });
    }

    /// Validate the key of an incoming object against its kind.
    fn key_for(kind: ResourceKind, meta: &ObjectMeta) -> StoreResult<ObjectKey> {
        if meta.name.is_empty() {
            return Err(StoreError::Invalid(format!("{kind} name is required")));
        }
        match (kind.is_namespaced(), meta.namespace.is_empty()) {
            (true, true) => Err(StoreError::Invalid(format!(
                "{kind} {} requires a namespace",
                meta.name
            ))),
            (false, false) => Err(StoreError::Invalid(format!(
                "{kind} {} is cluster-scoped",
                meta.name
            ))),
            _ => Ok(ObjectKey::new(&meta.namespace, &meta.name)),
        }
    }

    /// Replace stored object with `candidate` after a version check.
    ///
    /// `merge` builds the new body from (stored, candidate).
    fn replace(
        &self,
        kind: ResourceKind,
        candidate: Value,
        merge: impl FnOnce(&Value, Value) -> Value,
    ) -> StoreResult<Value> {
        let meta = meta_of(&candidate)?;
        let key = Self::key_for(kind, &meta)?;

        let mut objects = self.write();
        let stored = objects
            .get(&(kind, key.clone()))
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.to_string(),
            })?;
        let stored_meta = meta_of(stored)?;

        if meta.resource_version != 0 && meta.resource_version != stored_meta.resource_version {
            return Err(StoreError::Conflict {
                kind,
                key: key.to_string(),
                expected: meta.resource_version,
                actual: stored_meta.resource_version,
            });
        }

        let mut next = merge(stored, candidate);
        let mut next_meta = meta_of(&next)?;
        // Server-owned fields.
        next_meta.uid = stored_meta.uid;
        next_meta.creation_timestamp = stored_meta.creation_timestamp;
        next_meta.resource_version = stored_meta.resource_version;
        set_meta(&mut next, &next_meta)?;

        if &next == stored {
            return Ok(next);
        }

        next_meta.resource_version = self.next_version();
        set_meta(&mut next, &next_meta)?;
        objects.insert((kind, key), next.clone());
        self.emit(kind, WatchEventType::Modified, next.clone());
        Ok(next)
    }

    /// Remove an object and every object transitively owned by it.
    fn remove_cascading(&self, objects: &mut Objects, kind: ResourceKind, key: &ObjectKey) {
        let Some(removed) = objects.remove(&(kind, key.clone())) else {
            return;
        };
        let uid = meta_of(&removed).ok().and_then(|m| m.uid);
        self.emit(kind, WatchEventType::Deleted, removed);

        let Some(uid) = uid else {
            return;
        };
        let dependents: Vec<(ResourceKind, ObjectKey)> = objects
            .iter()
            .filter(|(_, obj)| meta_of(obj).map(|m| m.is_owned_by(&uid)).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();

        for (dep_kind, dep_key) in dependents {
            debug!(
                owner_kind = %kind,
                owner = %key,
                kind = %dep_kind,
                key = %dep_key,
                "Garbage collecting dependent"
            );
            self.remove_cascading(objects, dep_kind, &dep_key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn meta_of(object: &Value) -> StoreResult<ObjectMeta> {
    let meta = object
        .get("metadata")
        .ok_or_else(|| StoreError::Invalid("object has no metadata".to_string()))?;
    Ok(serde_json::from_value(meta.clone())?)
}

fn set_meta(object: &mut Value, meta: &ObjectMeta) -> StoreResult<()> {
    let Some(map) = object.as_object_mut() else {
        return Err(StoreError::Invalid("object is not a JSON map".to_string()));
    };
    map.insert("metadata".to_string(), serde_json::to_value(meta)?);
    Ok(())
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<Value> {
        self.check_available()?;
        self.read()
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.to_string(),
            })
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<Value>> {
        self.check_available()?;
        let objects = self.read();
        let mut out = Vec::new();
        for ((k, key), obj) in objects.iter() {
            if *k != kind || namespace.is_some_and(|ns| ns != key.namespace) {
                continue;
            }
            if selector.is_empty() || selector.matches(&meta_of(obj)?.labels) {
                out.push(obj.clone());
            }
        }
        Ok(out)
    }

    async fn create(&self, kind: ResourceKind, mut object: Value) -> StoreResult<Value> {
        self.check_available()?;
        let mut meta = meta_of(&object)?;
        let key = Self::key_for(kind, &meta)?;

        let mut objects = self.write();
        if objects.contains_key(&(kind, key.clone())) {
            return Err(StoreError::AlreadyExists {
                kind,
                key: key.to_string(),
            });
        }

        meta.uid = Some(ObjectUid::new());
        meta.resource_version = self.next_version();
        meta.creation_timestamp = Some(Utc::now());
        set_meta(&mut object, &meta)?;

        objects.insert((kind, key), object.clone());
        self.emit(kind, WatchEventType::Added, object.clone());
        Ok(object)
    }

    async fn update(&self, kind: ResourceKind, object: Value) -> StoreResult<Value> {
        self.check_available()?;
        self.replace(kind, object, |stored, mut candidate| {
            if kind.has_status() {
                if let (Some(map), Some(status)) = (candidate.as_object_mut(), stored.get("status")) {
                    map.insert("status".to_string(), status.clone());
                }
            }
            candidate
        })
    }

    async fn update_status(&self, kind: ResourceKind, object: Value) -> StoreResult<Value> {
        self.check_available()?;
        if !kind.has_status() {
            return Err(StoreError::Invalid(format!("{kind} has no status subresource")));
        }
        self.replace(kind, object, |stored, candidate| {
            let mut next = stored.clone();
            if let (Some(map), Some(status)) = (next.as_object_mut(), candidate.get("status")) {
                map.insert("status".to_string(), status.clone());
            }
            next
        })
    }

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<()> {
        self.check_available()?;
        let mut objects = self.write();
        if !objects.contains_key(&(kind, key.clone())) {
            return Err(StoreError::NotFound {
                kind,
                key: key.to_string(),
            });
        }
        self.remove_cascading(&mut objects, kind, key);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sbom(name: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": "default", "labels": {"scanjob": "job"}},
            "imageMetadata": {},
            "spdx": {"packages": []}
        })
    }

    #[tokio::test]
    async fn test_create_assigns_server_fields() {
        let store = MemoryStore::new();
        let created = store.create(ResourceKind::Sbom, sbom("a")).await.unwrap();
        let meta = meta_of(&created).unwrap();
        assert!(meta.uid.is_some());
        assert!(meta.resource_version > 0);
        assert!(meta.creation_timestamp.is_some());

        let err = store.create(ResourceKind::Sbom, sbom("a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_namespace_scope_is_enforced() {
        let store = MemoryStore::new();
        let err = store
            .create(ResourceKind::VexHub, json!({"metadata": {"name": "h", "namespace": "x"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let err = store
            .create(ResourceKind::Sbom, json!({"metadata": {"name": "s"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(ResourceKind::Sbom, sbom("a")).await.unwrap();

        let mut first = created.clone();
        first["spdx"] = json!({"packages": ["x"]});
        store.update(ResourceKind::Sbom, first).await.unwrap();

        let mut stale = created;
        stale["spdx"] = json!({"packages": ["y"]});
        let err = store.update(ResourceKind::Sbom, stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_noop_update_keeps_version() {
        let store = MemoryStore::new();
        let created = store.create(ResourceKind::Sbom, sbom("a")).await.unwrap();
        let mut rx = store.watch();

        let updated = store.update(ResourceKind::Sbom, created.clone()).await.unwrap();
        assert_eq!(updated, created);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_preserves_status_and_update_status_preserves_spec() {
        let store = MemoryStore::new();
        let job = json!({
            "metadata": {"name": "job", "namespace": "default"},
            "spec": {"registry": "reg"},
            "status": {"phase": "Pending"}
        });
        let created = store.create(ResourceKind::ScanJob, job).await.unwrap();

        let mut spec_change = created.clone();
        spec_change["spec"]["registry"] = json!("other");
        spec_change["status"]["phase"] = json!("Succeeded");
        let after_spec = store.update(ResourceKind::ScanJob, spec_change).await.unwrap();
        assert_eq!(after_spec["status"]["phase"], "Pending");
        assert_eq!(after_spec["spec"]["registry"], "other");

        let mut status_change = after_spec.clone();
        status_change["spec"]["registry"] = json!("ignored");
        status_change["status"]["phase"] = json!("Running");
        let after_status = store
            .update_status(ResourceKind::ScanJob, status_change)
            .await
            .unwrap();
        assert_eq!(after_status["status"]["phase"], "Running");
        assert_eq!(after_status["spec"]["registry"], "other");
    }

    #[tokio::test]
    async fn test_delete_cascades_to_owned_objects() {
        let store = MemoryStore::new();
        let owner = store.create(ResourceKind::Sbom, sbom("a")).await.unwrap();
        let owner_meta = meta_of(&owner).unwrap();

        let report = json!({
            "metadata": {
                "name": "a",
                "namespace": "default",
                "ownerReferences": [{
                    "kind": "Sbom",
                    "name": "a",
                    "uid": owner_meta.uid.unwrap().to_string(),
                    "controller": true
                }]
            },
            "imageMetadata": {},
            "report": {}
        });
        store
            .create(ResourceKind::VulnerabilityReport, report)
            .await
            .unwrap();
        assert_eq!(store.count(ResourceKind::VulnerabilityReport), 1);

        let mut rx = store.watch();
        store
            .delete(ResourceKind::Sbom, &ObjectKey::new("default", "a"))
            .await
            .unwrap();
        assert_eq!(store.count(ResourceKind::VulnerabilityReport), 0);

        assert_eq!(rx.try_recv().unwrap().kind, ResourceKind::Sbom);
        let gc = rx.try_recv().unwrap();
        assert_eq!(gc.kind, ResourceKind::VulnerabilityReport);
        assert_eq!(gc.event_type, WatchEventType::Deleted);
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace_and_selector() {
        let store = MemoryStore::new();
        store.create(ResourceKind::Sbom, sbom("a")).await.unwrap();
        let mut other = sbom("b");
        other["metadata"]["labels"]["scanjob"] = json!("other");
        store.create(ResourceKind::Sbom, other).await.unwrap();

        let selector = LabelSelector::new().with_label("scanjob", "job");
        let hits = store
            .list(ResourceKind::Sbom, Some("default"), &selector)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let none = store
            .list(ResourceKind::Sbom, Some("elsewhere"), &LabelSelector::new())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_injected_unavailability() {
        let store = MemoryStore::new();
        store.inject_unavailable(1);
        let err = store
            .get(ResourceKind::Sbom, &ObjectKey::new("default", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        let err = store
            .get(ResourceKind::Sbom, &ObjectKey::new("default", "a"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
