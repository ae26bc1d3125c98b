//! The timeline service tying all components together.
//!
//! Owns the ancestry graph, the per-timeline artifact stores, the exclusive
//! locks shared with background maintenance, and the on-disk layout:
//!
//! ```text
//! <root>/
//!   manifest.json
//!   .lock
//!   tenants/<tenant_id>/timelines/<timeline_id>/
//!       metadata.json
//!       artifacts.log
//! ```
//!
//! Deleting a timeline removes its whole directory; the directory's
//! presence is an observable contract.

use crate::ancestry::{AncestryGraph, TimelineRecord};
use crate::artifacts::{ArtifactStore, StoreRegistry};
use crate::error::{Result, StoreError};
use crate::maintenance::{ExclusiveLocks, MaintenanceWorker};
use crate::types::{
    DerivedArtifact, Lsn, RetentionPolicy, RetryPolicy, TenantId, TimelineDetail, TimelineId,
    TimelineState,
};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MANIFEST_FILE: &str = "manifest.json";
const LOCK_FILE: &str = ".lock";
const METADATA_FILE: &str = "metadata.json";
const ARTIFACT_LOG_FILE: &str = "artifacts.log";

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;

/// Service configuration.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Base path for all persisted state.
    pub path: PathBuf,

    /// Whether to create the service directory if it doesn't exist.
    pub create_if_missing: bool,

    /// How much retired-artifact history compaction may forget.
    pub retention: RetentionPolicy,

    /// Caller-side retry policy for `Busy` deletion failures.
    pub delete_retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./lineage"),
            create_if_missing: true,
            retention: RetentionPolicy::default(),
            delete_retry: RetryPolicy::default(),
        }
    }
}

/// Root manifest: format version plus the id counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    next_tenant_id: u64,
    next_timeline_id: u64,
}

/// The multi-tenant timeline service.
pub struct TimelineService {
    config: ServiceConfig,

    /// Lock file for exclusive process access.
    _lock_file: File,

    /// Process-wide ancestry graph.
    graph: Arc<AncestryGraph>,

    /// Open artifact stores.
    stores: Arc<StoreRegistry>,

    /// Per-timeline exclusive locks shared with maintenance.
    locks: Arc<ExclusiveLocks>,

    /// Running background worker, if any.
    maintenance: Mutex<Option<MaintenanceWorker>>,

    /// Serializes manifest rewrites.
    manifest_lock: Mutex<()>,
}

impl TimelineService {
    /// Open an existing service directory or create a new one.
    pub fn open_or_create(config: ServiceConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new, empty service directory.
    pub fn create(config: ServiceConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join("tenants"))?;

        let lock_file = Self::acquire_lock(&config.path)?;

        let service = Self {
            config,
            _lock_file: lock_file,
            graph: Arc::new(AncestryGraph::new(1, 1)),
            stores: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(ExclusiveLocks::new()),
            maintenance: Mutex::new(None),
            manifest_lock: Mutex::new(()),
        };
        service.save_manifest()?;
        Ok(service)
    }

    /// Open an existing service directory, rebuilding the ancestry graph
    /// from the persisted per-timeline metadata.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        let manifest = Self::read_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let graph = Arc::new(AncestryGraph::new(
            manifest.next_tenant_id,
            manifest.next_timeline_id,
        ));
        let stores: Arc<StoreRegistry> = Arc::new(RwLock::new(HashMap::new()));

        Self::scan_tenants(&config.path, &graph, &stores)?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            graph,
            stores,
            locks: Arc::new(ExclusiveLocks::new()),
            maintenance: Mutex::new(None),
            manifest_lock: Mutex::new(()),
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    fn read_manifest(path: &Path) -> Result<Manifest> {
        let bytes = fs::read(path.join(MANIFEST_FILE))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported format version: {}",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }

    fn save_manifest(&self) -> Result<()> {
        let _guard = self.manifest_lock.lock();
        let (next_tenant_id, next_timeline_id) = self.graph.counters();
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            next_tenant_id,
            next_timeline_id,
        };
        let encoded = serde_json::to_vec_pretty(&manifest)?;
        fs::write(self.config.path.join(MANIFEST_FILE), encoded)?;
        Ok(())
    }

    fn scan_tenants(
        root: &Path,
        graph: &Arc<AncestryGraph>,
        stores: &Arc<StoreRegistry>,
    ) -> Result<()> {
        let tenants_dir = root.join("tenants");
        for entry in fs::read_dir(&tenants_dir)? {
            let entry = entry?;
            let Some(tenant) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u64>().ok())
                .map(TenantId)
            else {
                tracing::warn!(path = %entry.path().display(), "skipping unrecognized tenant dir");
                continue;
            };

            graph.load_tenant(tenant);

            let timelines_dir = entry.path().join("timelines");
            if !timelines_dir.exists() {
                continue;
            }
            for tl_entry in fs::read_dir(&timelines_dir)? {
                let tl_entry = tl_entry?;
                let Some(timeline) = tl_entry
                    .file_name()
                    .to_str()
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(TimelineId)
                else {
                    tracing::warn!(
                        path = %tl_entry.path().display(),
                        "skipping unrecognized timeline dir"
                    );
                    continue;
                };

                let meta_path = tl_entry.path().join(METADATA_FILE);
                let metadata = match fs::read(&meta_path)
                    .map_err(StoreError::from)
                    .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
                {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        // Debris from an interrupted fork; not part of the graph.
                        tracing::warn!(
                            path = %meta_path.display(),
                            error = %e,
                            "skipping timeline with unreadable metadata"
                        );
                        continue;
                    }
                };

                let store = ArtifactStore::open(tl_entry.path().join(ARTIFACT_LOG_FILE))?;
                let record = TimelineRecord::from_metadata(metadata);
                graph.load_record(record)?;
                // Artifact events may have advanced past the last metadata write.
                graph.update_head(tenant, timeline, store.max_lsn())?;
                stores.write().insert((tenant, timeline), Arc::new(store));
            }
        }
        Ok(())
    }

    // --- Paths ---

    fn tenant_path(&self, tenant: TenantId) -> PathBuf {
        self.config.path.join("tenants").join(tenant.to_string())
    }

    /// On-disk path of a timeline's persisted state. Exists exactly while
    /// the timeline does.
    pub fn timeline_path(&self, tenant: TenantId, timeline: TimelineId) -> PathBuf {
        self.tenant_path(tenant)
            .join("timelines")
            .join(timeline.to_string())
    }

    fn write_metadata(&self, record: &TimelineRecord) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(&record.metadata())?;
        fs::write(
            self.timeline_path(record.tenant, record.id).join(METADATA_FILE),
            encoded,
        )?;
        Ok(())
    }

    fn store(&self, tenant: TenantId, timeline: TimelineId) -> Result<Arc<ArtifactStore>> {
        self.stores
            .read()
            .get(&(tenant, timeline))
            .cloned()
            .ok_or(StoreError::TimelineNotFound { timeline, tenant })
    }

    // --- Tenants ---

    /// Register a new tenant.
    pub fn create_tenant(&self) -> Result<TenantId> {
        let tenant = self.graph.create_tenant();
        fs::create_dir_all(self.tenant_path(tenant).join("timelines"))?;
        self.save_manifest()?;
        tracing::info!(%tenant, "created tenant");
        Ok(tenant)
    }

    pub fn tenant_exists(&self, tenant: TenantId) -> bool {
        self.graph.tenant_exists(tenant)
    }

    // --- Timeline creation (fork engine) ---

    /// Create a new root timeline for a tenant.
    pub fn create_timeline(&self, tenant: TenantId, name: &str) -> Result<TimelineId> {
        let record = self.graph.create_root(tenant, name)?;

        if let Err(e) = self.materialize(&record, Lsn(0), &[]) {
            let _ = self.graph.unregister(tenant, record.id);
            let _ = fs::remove_dir_all(self.timeline_path(tenant, record.id));
            return Err(e);
        }

        self.save_manifest()?;
        tracing::info!(%tenant, timeline = %record.id, name, "created root timeline");
        Ok(record.id)
    }

    /// Fork a new timeline from `parent` at position `at`.
    ///
    /// The child is seeded with exactly the derived-artifact snapshot valid
    /// at `at`; the two stores never share state afterwards.
    pub fn fork_timeline(
        &self,
        tenant: TenantId,
        parent: TimelineId,
        at: Lsn,
        name: &str,
    ) -> Result<TimelineId> {
        // Surfaces TenantNotFound/TimelineNotFound before touching the store.
        let parent_record = self.graph.get(tenant, parent)?;
        if parent_record.state != TimelineState::Active {
            return Err(StoreError::TimelineNotFound {
                timeline: parent,
                tenant,
            });
        }

        let parent_store = self.store(tenant, parent)?;
        // Point-in-time snapshot, mutually exclusive with concurrent
        // retirement at the same position.
        let snapshot = parent_store.snapshot_as_of(at)?;

        // Registration re-validates the parent under the tenant write lock,
        // so it linearizes against a concurrent delete.
        let record =
            self.graph
                .create_child(tenant, parent, at, parent_store.horizon(), name)?;

        if let Err(e) = self.materialize(&record, at, &snapshot) {
            let _ = self.graph.unregister(tenant, record.id);
            let _ = fs::remove_dir_all(self.timeline_path(tenant, record.id));
            return Err(e);
        }

        self.save_manifest()?;
        tracing::info!(
            %tenant,
            timeline = %record.id,
            %parent,
            fork_lsn = %at,
            artifacts = snapshot.len(),
            name,
            "forked timeline"
        );
        Ok(record.id)
    }

    fn materialize(
        &self,
        record: &TimelineRecord,
        horizon: Lsn,
        snapshot: &[DerivedArtifact],
    ) -> Result<()> {
        let dir = self.timeline_path(record.tenant, record.id);
        fs::create_dir_all(&dir)?;
        self.write_metadata(record)?;
        let store = ArtifactStore::create_seeded(dir.join(ARTIFACT_LOG_FILE), horizon, snapshot)?;
        self.stores
            .write()
            .insert((record.tenant, record.id), Arc::new(store));
        Ok(())
    }

    // --- Timeline detail ---

    /// Metadata for one timeline. A `Deleting` timeline is reported with
    /// that state; a deleted one is `TimelineNotFound`.
    pub fn timeline_detail(&self, tenant: TenantId, timeline: TimelineId) -> Result<TimelineDetail> {
        let record = self.graph.get(tenant, timeline)?;
        let (horizon, pending_artifacts) = match self.stores.read().get(&(tenant, timeline)) {
            Some(store) => (store.horizon(), store.pending_count()),
            None => (record.fork_lsn.unwrap_or(Lsn(0)), 0),
        };
        Ok(TimelineDetail {
            id: record.id,
            tenant: record.tenant,
            name: record.name,
            state: record.state,
            parent: record.parent,
            fork_lsn: record.fork_lsn,
            head: record.head,
            horizon,
            pending_artifacts,
        })
    }

    /// Resolve a timeline id by its tenant-unique name.
    pub fn timeline_by_name(&self, tenant: TenantId, name: &str) -> Result<Option<TimelineId>> {
        Ok(self.graph.get_by_name(tenant, name)?.map(|r| r.id))
    }

    /// Ids of all timelines of a tenant (Active and Deleting).
    pub fn list_timelines(&self, tenant: TenantId) -> Result<Vec<TimelineId>> {
        let mut ids: Vec<TimelineId> = self
            .graph
            .list_timelines(tenant)?
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    // --- Deletion manager ---

    /// Delete a timeline.
    ///
    /// Fails with `HasChildren` while any non-deleted child exists (leaving
    /// persisted state untouched), and with transient `Busy` while
    /// background maintenance holds the timeline's exclusive lock. A `Busy`
    /// failure leaves the timeline in `Deleting`; calling again resumes the
    /// deletion. After completion the timeline reports `TimelineNotFound`.
    pub fn delete_timeline(&self, tenant: TenantId, timeline: TimelineId) -> Result<()> {
        self.graph.begin_delete(tenant, timeline)?;

        let guard = self
            .locks
            .try_acquire(tenant, timeline)
            .ok_or(StoreError::Busy(timeline))?;

        let path = self.timeline_path(tenant, timeline);
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.stores.write().remove(&(tenant, timeline));
        self.graph.finish_delete(tenant, timeline)?;
        drop(guard);
        self.locks.remove(tenant, timeline);

        tracing::info!(%tenant, %timeline, "deleted timeline");
        Ok(())
    }

    /// Delete with the configured bounded retry on `Busy`.
    ///
    /// Retry lives here at the control-plane edge, not inside the deletion
    /// state machine; every other error is surfaced immediately.
    pub fn delete_timeline_retrying(&self, tenant: TenantId, timeline: TimelineId) -> Result<()> {
        let policy = self.config.delete_retry;
        let mut attempt = 1;
        loop {
            match self.delete_timeline(tenant, timeline) {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    tracing::debug!(
                        %tenant,
                        %timeline,
                        attempt,
                        "delete busy, retrying after {:?}",
                        policy.interval
                    );
                    std::thread::sleep(policy.interval);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    // --- Artifact lifecycle ---

    /// Record a pending derived artifact (e.g. a prepared transaction) at
    /// `lsn`, advancing the timeline's head.
    pub fn put_artifact(
        &self,
        tenant: TenantId,
        timeline: TimelineId,
        id: &str,
        lsn: Lsn,
        payload: &[u8],
    ) -> Result<bool> {
        self.active_record(tenant, timeline)?;
        let created = self.store(tenant, timeline)?.put(id, lsn, payload)?;
        self.graph.update_head(tenant, timeline, lsn)?;
        Ok(created)
    }

    /// Retire (commit/abort) a pending artifact at `lsn`, advancing the
    /// timeline's head.
    pub fn retire_artifact(
        &self,
        tenant: TenantId,
        timeline: TimelineId,
        id: &str,
        lsn: Lsn,
    ) -> Result<bool> {
        self.active_record(tenant, timeline)?;
        let retired = self.store(tenant, timeline)?.retire(id, lsn)?;
        self.graph.update_head(tenant, timeline, lsn)?;
        Ok(retired)
    }

    /// Advance a timeline's head, simulating ordinary database activity,
    /// and persist the new head.
    pub fn advance(&self, tenant: TenantId, timeline: TimelineId, lsn: Lsn) -> Result<Lsn> {
        self.active_record(tenant, timeline)?;
        let head = self.graph.update_head(tenant, timeline, lsn)?;
        let record = self.graph.get(tenant, timeline)?;
        self.write_metadata(&record)?;
        Ok(head)
    }

    /// Artifacts visible on a timeline at position `at`.
    pub fn snapshot_as_of(
        &self,
        tenant: TenantId,
        timeline: TimelineId,
        at: Lsn,
    ) -> Result<Vec<DerivedArtifact>> {
        self.graph.get(tenant, timeline)?;
        self.store(tenant, timeline)?.snapshot_as_of(at)
    }

    /// Currently pending artifacts on a timeline.
    pub fn pending_artifacts(
        &self,
        tenant: TenantId,
        timeline: TimelineId,
    ) -> Result<Vec<DerivedArtifact>> {
        self.graph.get(tenant, timeline)?;
        Ok(self.store(tenant, timeline)?.pending())
    }

    fn active_record(&self, tenant: TenantId, timeline: TimelineId) -> Result<TimelineRecord> {
        let record = self.graph.get(tenant, timeline)?;
        if record.state != TimelineState::Active {
            return Err(StoreError::TimelineNotFound { timeline, tenant });
        }
        Ok(record)
    }

    // --- Maintenance ---

    /// Start the background compaction worker.
    pub fn start_maintenance(&self, interval: std::time::Duration) {
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return;
        }
        *maintenance = Some(MaintenanceWorker::spawn(
            Arc::clone(&self.graph),
            Arc::clone(&self.stores),
            Arc::clone(&self.locks),
            self.config.retention,
            interval,
        ));
    }

    /// Stop the background worker, waiting for it to exit.
    pub fn stop_maintenance(&self) {
        if let Some(worker) = self.maintenance.lock().take() {
            worker.stop();
        }
    }

    /// Run one synchronous compaction pass (what the worker does per tick).
    pub fn run_maintenance_pass(&self) {
        MaintenanceWorker::run_pass(&self.graph, &self.stores, &self.locks, self.config.retention);
    }

    /// Exclusive locks shared between deletion and maintenance. Taking one
    /// makes concurrent deletion of that timeline fail `Busy`, exactly as a
    /// running compaction pass would.
    pub fn exclusive_locks(&self) -> &ExclusiveLocks {
        &self.locks
    }

    /// Flush and shut down.
    pub fn close(self) -> Result<()> {
        self.stop_maintenance();
        self.save_manifest()
    }
}
