//! The resource store interface.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use vscan_api::{LabelSelector, ObjectKey, ObjectMeta, Resource, ResourceKind};

use crate::{StoreError, StoreResult};

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A change notification. `object` is the state after the change (or the
/// last state, for deletions).
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: ResourceKind,
    pub event_type: WatchEventType,
    pub object: Value,
}

impl WatchEvent {
    pub fn metadata(&self) -> StoreResult<ObjectMeta> {
        Ok(serde_json::from_value(self.object["metadata"].clone())?)
    }

    pub fn key(&self) -> StoreResult<ObjectKey> {
        let meta = self.metadata()?;
        Ok(ObjectKey::new(meta.namespace, meta.name))
    }

    /// Decode the object as `R`; fails if the event is for another kind.
    pub fn decode<R: Resource>(&self) -> StoreResult<R> {
        if self.kind != R::KIND {
            return Err(StoreError::Invalid(format!(
                "cannot decode {} event as {}",
                self.kind,
                R::KIND
            )));
        }
        Ok(serde_json::from_value(self.object.clone())?)
    }
}

/// Durable, versioned record storage with watch/notify.
///
/// Objects cross this boundary as JSON; [`crate::Client`] provides the
/// typed view through each kind's serde codec.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<Value>;

    /// List objects of a kind, optionally restricted to one namespace.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<Value>>;

    /// Create an object. Assigns uid, resource version and creation time.
    async fn create(&self, kind: ResourceKind, object: Value) -> StoreResult<Value>;

    /// Replace an object (status excluded) if its resource version matches.
    async fn update(&self, kind: ResourceKind, object: Value) -> StoreResult<Value>;

    /// Replace only the status of an object if its resource version matches.
    async fn update_status(&self, kind: ResourceKind, object: Value) -> StoreResult<Value>;

    /// Delete an object and garbage-collect its dependents.
    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to change notifications for all kinds.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
