//! Typed client over a [`ResourceStore`].

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use vscan_api::{LabelSelector, ObjectKey, Resource};

use crate::{ResourceStore, StoreError, StoreResult, WatchEvent};

/// Attempts made by the read-modify-write helpers before giving up on a
/// contended object.
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Outcome of [`Client::create_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Typed access to the store through each kind's serde codec.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn ResourceStore>,
}

impl Client {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    pub async fn get<R: Resource>(&self, key: &ObjectKey) -> StoreResult<R> {
        decode(self.store.get(R::KIND, key).await?)
    }

    /// Like [`Client::get`] but maps `NotFound` to `None`.
    pub async fn get_opt<R: Resource>(&self, key: &ObjectKey) -> StoreResult<Option<R>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<R: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<R>> {
        self.store
            .list(R::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn create<R: Resource>(&self, obj: &R) -> StoreResult<R> {
        decode(self.store.create(R::KIND, serde_json::to_value(obj)?).await?)
    }

    pub async fn update<R: Resource>(&self, obj: &R) -> StoreResult<R> {
        decode(self.store.update(R::KIND, serde_json::to_value(obj)?).await?)
    }

    pub async fn update_status<R: Resource>(&self, obj: &R) -> StoreResult<R> {
        decode(
            self.store
                .update_status(R::KIND, serde_json::to_value(obj)?)
                .await?,
        )
    }

    pub async fn delete<R: Resource>(&self, key: &ObjectKey) -> StoreResult<()> {
        self.store.delete(R::KIND, key).await
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.store.watch()
    }

    /// Idempotently converge the object at `key`.
    ///
    /// Fetches the current object (or starts from an empty one), applies
    /// `mutate` and writes only if the result differs. Creation races and
    /// version conflicts are retried from a fresh read.
    pub async fn create_or_update<R, F>(
        &self,
        key: &ObjectKey,
        mut mutate: F,
    ) -> StoreResult<(R, OperationResult)>
    where
        R: Resource,
        F: FnMut(&mut R) -> StoreResult<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.get_opt::<R>(key).await? {
                None => {
                    let mut obj = R::with_key(key);
                    mutate(&mut obj)?;
                    self.create(&obj)
                        .await
                        .map(|created| (created, OperationResult::Created))
                }
                Some(current) => {
                    let mut obj = current.clone();
                    mutate(&mut obj)?;
                    if serde_json::to_value(&obj)? == serde_json::to_value(&current)? {
                        return Ok((current, OperationResult::Unchanged));
                    }
                    self.update(&obj)
                        .await
                        .map(|updated| (updated, OperationResult::Updated))
                }
            };

            match result {
                Err(e) if retryable_write(&e) && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(kind = %R::KIND, key = %key, attempt, error = %e, "Retrying write");
                }
                other => return other,
            }
        }
    }

    /// Read-modify-write of the status of the object at `key`.
    ///
    /// Returns the stored object unchanged when `mutate` leaves it as is.
    pub async fn update_status_with<R, F>(&self, key: &ObjectKey, mut mutate: F) -> StoreResult<R>
    where
        R: Resource,
        F: FnMut(&mut R),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current: R = self.get(key).await?;
            let mut obj = current.clone();
            mutate(&mut obj);
            if serde_json::to_value(&obj)? == serde_json::to_value(&current)? {
                return Ok(current);
            }

            match self.update_status(&obj).await {
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(kind = %R::KIND, key = %key, attempt, "Status conflict, retrying");
                }
                other => return other,
            }
        }
    }
}

fn retryable_write(err: &StoreError) -> bool {
    err.is_already_exists() || err.is_conflict()
}

fn decode<R: Resource>(value: Value) -> StoreResult<R> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use rstest::rstest;
    use vscan_api::{ImageMetadata, Sbom, ScanJob, ScanJobPhase, VulnerabilityReport};

    fn client() -> Client {
        Client::new(Arc::new(MemoryStore::new()))
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "report")
    }

    fn set_report(report: serde_json::Value) -> impl FnMut(&mut VulnerabilityReport) -> StoreResult<()> {
        move |r| {
            r.image_metadata = ImageMetadata {
                repository: "library/alpine".into(),
                ..Default::default()
            };
            r.report = report.clone();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_or_update_is_idempotent() {
        let client = client();
        let body = serde_json::json!({"runs": []});

        let (first, op) = client
            .create_or_update(&key(), set_report(body.clone()))
            .await
            .unwrap();
        assert_eq!(op, OperationResult::Created);

        let (second, op) = client
            .create_or_update(&key(), set_report(body))
            .await
            .unwrap();
        assert_eq!(op, OperationResult::Unchanged);
        assert_eq!(first.metadata.resource_version, second.metadata.resource_version);

        let (third, op) = client
            .create_or_update(&key(), set_report(serde_json::json!({"runs": [1]})))
            .await
            .unwrap();
        assert_eq!(op, OperationResult::Updated);
        assert_eq!(third.metadata.uid, first.metadata.uid);
        assert!(third.metadata.resource_version > first.metadata.resource_version);
    }

    #[rstest]
    #[case::missing("nope", true)]
    #[case::present("artifact", false)]
    #[tokio::test]
    async fn test_get_opt(#[case] name: &str, #[case] expect_none: bool) {
        let client = client();
        let mut sbom = Sbom::with_key(&ObjectKey::new("default", "artifact"));
        sbom.spdx = serde_json::json!({});
        client.create(&sbom).await.unwrap();

        let found = client
            .get_opt::<Sbom>(&ObjectKey::new("default", name))
            .await
            .unwrap();
        assert_eq!(found.is_none(), expect_none);
    }

    #[tokio::test]
    async fn test_update_status_with_only_touches_status() {
        let client = client();
        let mut job = ScanJob::with_key(&ObjectKey::new("default", "job"));
        job.spec.registry = "reg".into();
        client.create(&job).await.unwrap();

        let updated: ScanJob = client
            .update_status_with(&ObjectKey::new("default", "job"), |j: &mut ScanJob| {
                j.status.phase = ScanJobPhase::Running;
                j.spec.registry = "ignored".into();
            })
            .await
            .unwrap();
        assert_eq!(updated.status.phase, ScanJobPhase::Running);
        assert_eq!(updated.spec.registry, "reg");
    }

    #[tokio::test]
    async fn test_update_status_with_missing_object() {
        let client = client();
        let err = client
            .update_status_with(&ObjectKey::new("default", "job"), |_: &mut ScanJob| {})
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
