//! Secondary index from ScanJob to the SBOMs and reports labeled with it.
//!
//! The ScanJob to SBOM relation is a label, not an owner reference, so the
//! store cannot answer "which SBOMs belong to this job" structurally. The
//! index is fed by watch events and rebuilt from a full listing at startup
//! and whenever the watch falls behind.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use vscan_api::{
    LabelSelector, ObjectKey, ObjectMeta, ObjectUid, Resource, ResourceKind, Sbom,
    VulnerabilityReport, LABEL_SCAN_JOB, LABEL_SCAN_JOB_UID,
};
use vscan_store::{Client, StoreResult, WatchEvent, WatchEventType};

use crate::status::Progress;

/// A ScanJob as referenced from the labels of a derived object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobRef {
    pub key: ObjectKey,
    pub uid: ObjectUid,
}

impl JobRef {
    /// Reads the correlation labels of `meta`.
    ///
    /// Objects without both labels are not correlated with any job.
    pub fn from_labels(meta: &ObjectMeta) -> Option<Self> {
        let name = meta.label(LABEL_SCAN_JOB)?;
        let uid = meta.label(LABEL_SCAN_JOB_UID)?.parse().ok()?;
        Some(Self {
            key: ObjectKey::new(&meta.namespace, name),
            uid,
        })
    }
}

#[derive(Debug, Default, Clone)]
struct Entry {
    sboms: BTreeSet<String>,
    reports: BTreeSet<String>,
}

/// Job uid to derived object names.
#[derive(Default)]
pub struct CorrelationIndex {
    entries: RwLock<HashMap<ObjectUid, Entry>>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectUid, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectUid, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a watch event. Returns the job the object belongs to, if any.
    pub fn apply(&self, event: &WatchEvent) -> Option<JobRef> {
        if !matches!(event.kind, ResourceKind::Sbom | ResourceKind::VulnerabilityReport) {
            return None;
        }
        let meta = event.metadata().ok()?;
        let job = JobRef::from_labels(&meta)?;
        match event.event_type {
            WatchEventType::Added | WatchEventType::Modified => {
                self.insert(event.kind, job.uid, &meta.name)
            }
            WatchEventType::Deleted => self.remove(event.kind, job.uid, &meta.name),
        }
        Some(job)
    }

    /// Record an object this process has just written.
    pub fn observe<R: Resource>(&self, obj: &R) {
        if let Some(job) = JobRef::from_labels(obj.metadata()) {
            self.insert(R::KIND, job.uid, &obj.metadata().name);
        }
    }

    fn insert(&self, kind: ResourceKind, job: ObjectUid, name: &str) {
        let mut entries = self.write();
        let entry = entries.entry(job).or_default();
        match kind {
            ResourceKind::Sbom => entry.sboms.insert(name.to_string()),
            _ => entry.reports.insert(name.to_string()),
        };
    }

    fn remove(&self, kind: ResourceKind, job: ObjectUid, name: &str) {
        let mut entries = self.write();
        if let Some(entry) = entries.get_mut(&job) {
            match kind {
                ResourceKind::Sbom => entry.sboms.remove(name),
                _ => entry.reports.remove(name),
            };
            if entry.sboms.is_empty() && entry.reports.is_empty() {
                entries.remove(&job);
            }
        }
    }

    /// Replace the whole index with a fresh listing of the store.
    pub async fn rebuild(&self, client: &Client) -> StoreResult<()> {
        let selector = LabelSelector::new();
        let sboms: Vec<Sbom> = client.list(None, &selector).await?;
        let reports: Vec<VulnerabilityReport> = client.list(None, &selector).await?;

        let mut fresh: HashMap<ObjectUid, Entry> = HashMap::new();
        for sbom in &sboms {
            if let Some(job) = JobRef::from_labels(&sbom.metadata) {
                fresh.entry(job.uid).or_default().sboms.insert(sbom.metadata.name.clone());
            }
        }
        for report in &reports {
            if let Some(job) = JobRef::from_labels(&report.metadata) {
                fresh
                    .entry(job.uid)
                    .or_default()
                    .reports
                    .insert(report.metadata.name.clone());
            }
        }

        debug!(
            jobs = fresh.len(),
            sboms = sboms.len(),
            reports = reports.len(),
            "Rebuilt correlation index"
        );
        *self.write() = fresh;
        Ok(())
    }

    /// SBOM and report counts for a job. Only reports that match one of the
    /// job's SBOMs count.
    pub fn progress(&self, job: &ObjectUid) -> Progress {
        let entries = self.read();
        let Some(entry) = entries.get(job) else {
            return Progress::default();
        };
        Progress {
            sboms: entry.sboms.len() as u32,
            reports: entry.sboms.intersection(&entry.reports).count() as u32,
        }
    }

    /// Names of the job's SBOMs that have no report yet.
    pub fn unscanned(&self, job: &ObjectUid) -> Vec<String> {
        self.read()
            .get(job)
            .map(|entry| entry.sboms.difference(&entry.reports).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of jobs with at least one derived object.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: ResourceKind, event_type: WatchEventType, name: &str, uid: &ObjectUid) -> WatchEvent {
        WatchEvent {
            kind,
            event_type,
            object: json!({
                "metadata": {
                    "name": name,
                    "namespace": "default",
                    "labels": {"scanjob": "job", "scanjob-uid": uid.to_string()}
                }
            }),
        }
    }

    #[test]
    fn test_progress_counts_only_matching_reports() {
        let index = CorrelationIndex::new();
        let uid = ObjectUid::new();

        for name in ["sbom-a", "sbom-b"] {
            index.apply(&event(ResourceKind::Sbom, WatchEventType::Added, name, &uid));
        }
        index.apply(&event(ResourceKind::VulnerabilityReport, WatchEventType::Added, "sbom-a", &uid));
        index.apply(&event(ResourceKind::VulnerabilityReport, WatchEventType::Added, "stray", &uid));

        assert_eq!(index.progress(&uid), Progress { sboms: 2, reports: 1 });
        assert_eq!(index.unscanned(&uid), vec!["sbom-b".to_string()]);
    }

    #[test]
    fn test_apply_returns_owning_job() {
        let index = CorrelationIndex::new();
        let uid = ObjectUid::new();
        let job = index
            .apply(&event(ResourceKind::Sbom, WatchEventType::Added, "sbom-a", &uid))
            .unwrap();
        assert_eq!(job.key, ObjectKey::new("default", "job"));
        assert_eq!(job.uid, uid);

        let unrelated = WatchEvent {
            kind: ResourceKind::Sbom,
            event_type: WatchEventType::Added,
            object: json!({"metadata": {"name": "x", "namespace": "default"}}),
        };
        assert!(index.apply(&unrelated).is_none());
    }

    #[test]
    fn test_deletes_shrink_and_drop_entries() {
        let index = CorrelationIndex::new();
        let uid = ObjectUid::new();
        index.apply(&event(ResourceKind::Sbom, WatchEventType::Added, "sbom-a", &uid));
        index.apply(&event(ResourceKind::VulnerabilityReport, WatchEventType::Added, "sbom-a", &uid));
        assert_eq!(index.len(), 1);

        index.apply(&event(ResourceKind::VulnerabilityReport, WatchEventType::Deleted, "sbom-a", &uid));
        assert_eq!(index.progress(&uid), Progress { sboms: 1, reports: 0 });

        index.apply(&event(ResourceKind::Sbom, WatchEventType::Deleted, "sbom-a", &uid));
        assert!(index.is_empty());
    }
}
