//! Versioned index lifecycle management.
//!
//! One [`IndexManager`] instance owns the build state of every project:
//!
//! - **Dirty tracking** — [`IndexManager::mark_dirty`] records a dirty
//!   epoch, raises `target_version` above `current_version`, and starts a
//!   background build if none is running.
//! - **Single flight** — at most one build per project runs at a time. A
//!   worker loop re-checks the target after publishing and runs one coalesced
//!   follow-up build if more dirtiness accrued, so 100 concurrent
//!   `mark_dirty` calls during a build produce at most one extra build.
//! - **Atomic publish** — artifacts are written to version-suffixed
//!   locations first; the single store of the meta record is what advances
//!   the published version. Readers holding an older [`IndexSnapshot`] keep
//!   a fully deserialized copy, so artifact reclamation can never invalidate
//!   them.
//! - **Change detection** — when the record fingerprint equals the published
//!   one the build completes immediately, refreshing only `built_at`.
//! - **Failure** — build errors land in `BuildState.last_error` and do not
//!   advance `current_version`; the next `mark_dirty` retries.
//!
//! Old artifact versions are pruned after publish, keeping the most recent
//! three on storage.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{error, info};

use crate::embedding::Embedder;
use crate::error::{Result, ServiceError};
use crate::index::{self, BasicArtifact, DenseArtifact, SparseArtifact};
use crate::models::{ArtifactKind, BuildState, IndexVersionMeta};
use crate::storage::Storage;

/// Published versions kept on storage after a successful build.
const KEEP_VERSIONS: usize = 3;

/// An immutable, refcounted view of one published index version.
///
/// Holding the `Arc` pins the deserialized artifacts for the lifetime of a
/// query regardless of concurrent publishes or pruning.
pub struct IndexSnapshot {
    pub version: u64,
    pub fingerprint: String,
    pub basic: BasicArtifact,
    pub sparse: Option<SparseArtifact>,
    pub dense: Option<DenseArtifact>,
}

/// Internal slot state: the externally visible [`BuildState`] plus the
/// dirtiness counters that drive scheduling.
///
/// `dirty_epoch` advances on every `mark_dirty`; `consumed_epoch` records
/// the epoch the last build pass observed. The version counters track real
/// published versions: `target_version` is the version the next publish
/// will carry, so a fingerprint-skip pulls it back level with
/// `current_version` once the dirtiness is consumed.
#[derive(Default)]
struct SlotState {
    build: BuildState,
    dirty_epoch: u64,
    consumed_epoch: u64,
}

struct ProjectSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

struct Inner {
    storage: Arc<dyn Storage>,
    embedder: Option<Arc<dyn Embedder>>,
    slots: Mutex<HashMap<String, Arc<ProjectSlot>>>,
    snapshots: Mutex<HashMap<String, Arc<IndexSnapshot>>>,
}

#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<Inner>,
}

impl IndexManager {
    pub fn new(storage: Arc<dyn Storage>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                embedder,
                slots: Mutex::new(HashMap::new()),
                snapshots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get or create the project's build slot, seeding the version counters
    /// from the published meta record after a restart.
    async fn slot(&self, project_id: &str) -> Result<Arc<ProjectSlot>> {
        if let Some(slot) = self.inner.slots.lock().unwrap().get(project_id) {
            return Ok(slot.clone());
        }
        let published = self
            .inner
            .storage
            .get_current_index_meta(project_id)
            .await?
            .map(|m| m.version)
            .unwrap_or(0);
        let mut slots = self.inner.slots.lock().unwrap();
        let slot = slots
            .entry(project_id.to_string())
            .or_insert_with(|| {
                Arc::new(ProjectSlot {
                    state: Mutex::new(SlotState {
                        build: BuildState {
                            current_version: published,
                            target_version: published,
                            ..BuildState::default()
                        },
                        ..SlotState::default()
                    }),
                    notify: Notify::new(),
                })
            })
            .clone();
        Ok(slot)
    }

    /// Record new dirtiness and ensure a build is (or will be) running.
    pub async fn mark_dirty(&self, project_id: &str) -> Result<()> {
        let slot = self.slot(project_id).await?;
        let spawn = {
            let mut state = slot.state.lock().unwrap();
            state.dirty_epoch += 1;
            if state.build.building {
                false
            } else {
                state.build.target_version = state.build.current_version + 1;
                state.build.building = true;
                state.build.started_at = Some(Utc::now());
                true
            }
        };
        if spawn {
            let inner = self.inner.clone();
            let project_id = project_id.to_string();
            tokio::spawn(async move {
                run_worker(inner, project_id, slot).await;
            });
        }
        Ok(())
    }

    /// Current build state for a project.
    pub async fn status(&self, project_id: &str) -> Result<BuildState> {
        let slot = self.slot(project_id).await?;
        let state = slot.state.lock().unwrap();
        Ok(state.build.clone())
    }

    /// `mark_dirty` plus waiting for the resulting build to complete.
    pub async fn rebuild_now(&self, project_id: &str) -> Result<BuildState> {
        self.mark_dirty(project_id).await?;
        let slot = self.slot(project_id).await?;
        loop {
            let notified = slot.notify.notified();
            {
                let state = slot.state.lock().unwrap();
                if !state.build.building {
                    if state.build.current_version >= state.build.target_version {
                        return Ok(state.build.clone());
                    }
                    let detail = state
                        .build
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "build did not reach target".to_string());
                    return Err(ServiceError::BuildFailure(detail));
                }
            }
            notified.await;
        }
    }

    /// Refcounted handle to the currently published artifacts, or `None`
    /// when the project has no index yet.
    pub async fn snapshot(&self, project_id: &str) -> Result<Option<Arc<IndexSnapshot>>> {
        let meta = match self.inner.storage.get_current_index_meta(project_id).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };

        if let Some(cached) = self.inner.snapshots.lock().unwrap().get(project_id) {
            if cached.version == meta.version && cached.fingerprint == meta.record_fingerprint {
                return Ok(Some(cached.clone()));
            }
        }

        let snapshot = Arc::new(load_snapshot(self.inner.storage.as_ref(), project_id, &meta).await?);
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .insert(project_id.to_string(), snapshot.clone());
        Ok(Some(snapshot))
    }

    /// Versions still present on storage, ascending.
    pub async fn retained_versions(&self, project_id: &str) -> Result<Vec<u64>> {
        self.inner.storage.list_index_versions(project_id).await
    }

    /// Published meta record, if any.
    pub async fn published_meta(&self, project_id: &str) -> Result<Option<IndexVersionMeta>> {
        self.inner.storage.get_current_index_meta(project_id).await
    }
}

async fn load_snapshot(
    storage: &dyn Storage,
    project_id: &str,
    meta: &IndexVersionMeta,
) -> Result<IndexSnapshot> {
    let basic_bytes = storage
        .get_index_artifact(project_id, meta.version, ArtifactKind::Basic)
        .await?
        .ok_or_else(|| {
            ServiceError::Internal(anyhow::anyhow!(
                "published version {} is missing its basic artifact",
                meta.version
            ))
        })?;
    let basic: BasicArtifact = serde_json::from_slice(&basic_bytes)?;

    let sparse = match storage
        .get_index_artifact(project_id, meta.version, ArtifactKind::Sparse)
        .await?
    {
        Some(bytes) => Some(serde_json::from_slice(&bytes)?),
        None => None,
    };
    let dense = match storage
        .get_index_artifact(project_id, meta.version, ArtifactKind::Dense)
        .await?
    {
        Some(bytes) => Some(serde_json::from_slice(&bytes)?),
        None => None,
    };

    Ok(IndexSnapshot {
        version: meta.version,
        fingerprint: meta.record_fingerprint.clone(),
        basic,
        sparse,
        dense,
    })
}

/// Per-project build worker. Runs while dirtiness remains, then exits.
async fn run_worker(inner: Arc<Inner>, project_id: String, slot: Arc<ProjectSlot>) {
    loop {
        let (epoch, target) = {
            let state = slot.state.lock().unwrap();
            (state.dirty_epoch, state.build.target_version)
        };
        let outcome = build_once(&inner, &project_id, target).await;

        let run_again = {
            let mut state = slot.state.lock().unwrap();
            state.build.builds_run += 1;
            state.consumed_epoch = epoch;
            match &outcome {
                Ok(version) => {
                    // On a fingerprint skip this is the prior published
                    // version, so both counters settle on what readers
                    // actually observe.
                    state.build.current_version = *version;
                    state.build.target_version = *version;
                    state.build.last_error = None;
                    info!(project = %project_id, version = *version, "index published");
                }
                Err(e) => {
                    state.build.last_error = Some(e.to_string());
                    error!(project = %project_id, error = %e, "index build failed");
                }
            }
            let again = outcome.is_ok() && state.dirty_epoch > state.consumed_epoch;
            if again {
                state.build.target_version = state.build.current_version + 1;
            } else {
                state.build.building = false;
                state.build.started_at = None;
            }
            again
        };

        if !run_again {
            slot.notify.notify_waiters();
            return;
        }
    }
}

/// One build pass toward `target`. Returns the published artifact version
/// (which stays at the prior value on a fingerprint skip).
async fn build_once(inner: &Inner, project_id: &str, target: u64) -> Result<u64> {
    let faqs = inner.storage.list_faqs(project_id).await?;
    let kb = inner.storage.list_kb(project_id).await?;
    let records = index::collect_records(&faqs, &kb);
    let fingerprint = index::fingerprint(&records);

    let published = inner.storage.get_current_index_meta(project_id).await?;
    if let Some(mut meta) = published {
        if meta.record_fingerprint == fingerprint {
            // Unchanged records: the artifacts a rebuild would produce are
            // identical, so only refresh the build timestamp.
            meta.built_at = Utc::now();
            inner
                .storage
                .set_current_index_meta(project_id, &meta)
                .await?;
            return Ok(meta.version);
        }
    }

    let output = index::build_artifacts(&records, inner.embedder.as_deref()).await;

    let basic_bytes =
        serde_json::to_vec(&output.basic).map_err(|e| ServiceError::BuildFailure(e.to_string()))?;
    inner
        .storage
        .put_index_artifact(project_id, target, ArtifactKind::Basic, &basic_bytes)
        .await?;
    if let Some(sparse) = &output.sparse {
        let bytes =
            serde_json::to_vec(sparse).map_err(|e| ServiceError::BuildFailure(e.to_string()))?;
        inner
            .storage
            .put_index_artifact(project_id, target, ArtifactKind::Sparse, &bytes)
            .await?;
    }
    if let Some(dense) = &output.dense {
        let bytes =
            serde_json::to_vec(dense).map_err(|e| ServiceError::BuildFailure(e.to_string()))?;
        inner
            .storage
            .put_index_artifact(project_id, target, ArtifactKind::Dense, &bytes)
            .await?;
    }

    let meta = IndexVersionMeta {
        project_id: project_id.to_string(),
        version: target,
        built_at: Utc::now(),
        record_fingerprint: fingerprint,
        dense_available: output.dense.is_some(),
        sparse_available: output.sparse.is_some(),
        item_count: records.len(),
    };
    let meta_bytes =
        serde_json::to_vec(&meta).map_err(|e| ServiceError::BuildFailure(e.to_string()))?;
    inner
        .storage
        .put_index_artifact(project_id, target, ArtifactKind::Meta, &meta_bytes)
        .await?;

    // Publish: this single store is what makes the new version visible.
    inner
        .storage
        .set_current_index_meta(project_id, &meta)
        .await?;
    inner.snapshots.lock().unwrap().remove(project_id);

    prune_versions(inner, project_id, target).await;
    Ok(target)
}

/// Delete artifact directories beyond the retention window. Live readers are
/// unaffected: snapshots hold deserialized copies.
async fn prune_versions(inner: &Inner, project_id: &str, just_published: u64) {
    let versions = match inner.storage.list_index_versions(project_id).await {
        Ok(v) => v,
        Err(_) => return,
    };
    let mut old: Vec<u64> = versions
        .into_iter()
        .filter(|v| *v != just_published)
        .collect();
    old.sort_unstable_by(|a, b| b.cmp(a));
    for version in old.into_iter().skip(KEEP_VERSIONS - 1) {
        if let Err(e) = inner
            .storage
            .delete_index_version(project_id, version)
            .await
        {
            error!(project = %project_id, version, error = %e, "failed to prune index version");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FaqRecord, RecordSource};
    use crate::storage_memory::MemoryStorage;

    fn faq(question: &str, answer: &str) -> FaqRecord {
        FaqRecord {
            id: crate::ident::mint("faq", &["p1", question]),
            project_id: "p1".to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            source: RecordSource::Manual,
            created_at: Utc::now(),
        }
    }

    async fn manager_with_storage() -> (IndexManager, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        (IndexManager::new(storage.clone(), None), storage)
    }

    #[tokio::test]
    async fn rebuild_publishes_and_snapshot_reflects_records() {
        let (manager, storage) = manager_with_storage().await;
        storage.put_faq("p1", faq("refund policy", "thirty days")).await.unwrap();

        let state = manager.rebuild_now("p1").await.unwrap();
        assert!(state.current_version >= 1);
        assert_eq!(state.current_version, state.target_version);
        assert!(!state.building);

        let snapshot = manager.snapshot("p1").await.unwrap().expect("snapshot");
        assert_eq!(snapshot.basic.entries.len(), 1);
        assert!(snapshot.sparse.is_some());
        assert!(snapshot.dense.is_none());
    }

    #[tokio::test]
    async fn unchanged_records_skip_the_rebuild() {
        let (manager, storage) = manager_with_storage().await;
        storage.put_faq("p1", faq("q", "a")).await.unwrap();

        manager.rebuild_now("p1").await.unwrap();
        let first = manager.published_meta("p1").await.unwrap().unwrap();

        manager.rebuild_now("p1").await.unwrap();
        let second = manager.published_meta("p1").await.unwrap().unwrap();

        // Same artifact version with a refreshed timestamp; the counters
        // settle back on the version readers actually observe.
        assert_eq!(first.version, second.version);
        assert!(second.built_at >= first.built_at);
        let state = manager.status("p1").await.unwrap();
        assert_eq!(state.current_version, state.target_version);
        assert_eq!(state.current_version, first.version);
    }

    #[tokio::test]
    async fn concurrent_dirtiness_coalesces_into_at_most_two_builds() {
        let (manager, storage) = manager_with_storage().await;
        storage.put_faq("p1", faq("q0", "a0")).await.unwrap();
        manager.rebuild_now("p1").await.unwrap();
        let before = manager.status("p1").await.unwrap().builds_run;

        storage.put_faq("p1", faq("q1", "a1")).await.unwrap();
        for _ in 0..100 {
            manager.mark_dirty("p1").await.unwrap();
        }
        // Wait for the worker to drain.
        loop {
            let state = manager.status("p1").await.unwrap();
            if !state.building && state.current_version == state.target_version {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let after = manager.status("p1").await.unwrap().builds_run;
        assert!(
            after - before <= 2,
            "expected at most 2 builds, saw {}",
            after - before
        );
    }

    #[tokio::test]
    async fn snapshot_is_none_before_first_build() {
        let (manager, _storage) = manager_with_storage().await;
        assert!(manager.snapshot("fresh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn old_versions_are_pruned() {
        let (manager, storage) = manager_with_storage().await;
        for i in 0..6 {
            storage
                .put_faq("p1", faq(&format!("q{}", i), "a"))
                .await
                .unwrap();
            manager.rebuild_now("p1").await.unwrap();
        }
        let versions = manager.retained_versions("p1").await.unwrap();
        assert!(versions.len() <= KEEP_VERSIONS);
        let published = manager.published_meta("p1").await.unwrap().unwrap();
        assert!(versions.contains(&published.version));
    }

    #[tokio::test]
    async fn old_snapshot_survives_publish() {
        let (manager, storage) = manager_with_storage().await;
        storage.put_faq("p1", faq("first", "answer")).await.unwrap();
        manager.rebuild_now("p1").await.unwrap();
        let pinned = manager.snapshot("p1").await.unwrap().unwrap();

        storage.put_faq("p1", faq("second", "answer")).await.unwrap();
        manager.rebuild_now("p1").await.unwrap();

        // The pinned snapshot still serves the old record set.
        assert_eq!(pinned.basic.entries.len(), 1);
        let fresh = manager.snapshot("p1").await.unwrap().unwrap();
        assert_eq!(fresh.basic.entries.len(), 2);
        assert!(fresh.version > pinned.version);
    }
}
