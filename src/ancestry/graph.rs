//! In-memory ancestry graph with per-tenant locking.
//!
//! The graph is the process-wide registry of tenants, their timelines and
//! parent/child links. It is rebuilt on startup from the persisted
//! per-timeline metadata; all mutation goes through the fork and deletion
//! paths in the service.
//!
//! Locking is two-level: a read-mostly outer map of tenants, and one
//! `RwLock` per tenant shard. Operations on unrelated tenants never
//! contend.

use crate::error::{Result, StoreError};
use crate::types::{Lsn, TenantId, TimelineId, TimelineMetadata, TimelineState, Timestamp};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A timeline's entry in the graph.
#[derive(Clone, Debug)]
pub struct TimelineRecord {
    pub id: TimelineId,
    pub tenant: TenantId,
    pub name: String,
    pub parent: Option<TimelineId>,
    pub fork_lsn: Option<Lsn>,
    pub state: TimelineState,
    pub head: Lsn,
    pub created: Timestamp,
}

impl TimelineRecord {
    /// Persisted form of this record.
    pub fn metadata(&self) -> TimelineMetadata {
        TimelineMetadata {
            id: self.id,
            tenant: self.tenant,
            name: self.name.clone(),
            parent: self.parent,
            fork_lsn: self.fork_lsn,
            head: self.head,
            created: self.created,
        }
    }

    /// Rebuild a record from its persisted form.
    ///
    /// `Deleting` is not persisted: an interrupted deletion comes back as
    /// `Active` and the caller re-issues the delete.
    pub fn from_metadata(meta: TimelineMetadata) -> Self {
        Self {
            id: meta.id,
            tenant: meta.tenant,
            name: meta.name,
            parent: meta.parent,
            fork_lsn: meta.fork_lsn,
            state: TimelineState::Active,
            head: meta.head,
            created: meta.created,
        }
    }
}

/// Per-tenant timeline table plus the derived children index.
#[derive(Default)]
struct TenantTimelines {
    records: HashMap<TimelineId, TimelineRecord>,
    /// Incrementally maintained: id -> ids of its non-deleted children.
    children: HashMap<TimelineId, HashSet<TimelineId>>,
    names: HashMap<String, TimelineId>,
}

impl TenantTimelines {
    fn insert(&mut self, record: TimelineRecord) {
        self.names.insert(record.name.clone(), record.id);
        self.children.entry(record.id).or_default();
        if let Some(parent) = record.parent {
            self.children.entry(parent).or_default().insert(record.id);
        }
        self.records.insert(record.id, record);
    }

    fn remove(&mut self, id: TimelineId) -> Option<TimelineRecord> {
        let record = self.records.remove(&id)?;
        self.names.remove(&record.name);
        self.children.remove(&id);
        if let Some(parent) = record.parent {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(&id);
            }
        }
        Some(record)
    }
}

struct TenantShard {
    timelines: RwLock<TenantTimelines>,
}

/// Process-wide ancestry graph.
pub struct AncestryGraph {
    tenants: RwLock<HashMap<TenantId, Arc<TenantShard>>>,
    next_tenant_id: AtomicU64,
    next_timeline_id: AtomicU64,
}

impl AncestryGraph {
    /// Create an empty graph with id counters seeded from the manifest.
    pub fn new(next_tenant_id: u64, next_timeline_id: u64) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            next_tenant_id: AtomicU64::new(next_tenant_id.max(1)),
            next_timeline_id: AtomicU64::new(next_timeline_id.max(1)),
        }
    }

    /// Current id counters, for persisting back to the manifest.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.next_tenant_id.load(Ordering::SeqCst),
            self.next_timeline_id.load(Ordering::SeqCst),
        )
    }

    /// Register a new tenant and return its id.
    pub fn create_tenant(&self) -> TenantId {
        let id = TenantId(self.next_tenant_id.fetch_add(1, Ordering::SeqCst));
        self.tenants.write().insert(
            id,
            Arc::new(TenantShard {
                timelines: RwLock::new(TenantTimelines::default()),
            }),
        );
        id
    }

    /// Re-register a tenant found on disk during startup.
    pub fn load_tenant(&self, id: TenantId) {
        self.tenants.write().entry(id).or_insert_with(|| {
            Arc::new(TenantShard {
                timelines: RwLock::new(TenantTimelines::default()),
            })
        });
    }

    /// Re-insert a timeline record rebuilt from persisted metadata.
    pub fn load_record(&self, record: TimelineRecord) -> Result<()> {
        let shard = self.shard(record.tenant)?;
        shard.timelines.write().insert(record);
        Ok(())
    }

    pub fn tenant_exists(&self, tenant: TenantId) -> bool {
        self.tenants.read().contains_key(&tenant)
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        self.tenants.read().keys().copied().collect()
    }

    fn shard(&self, tenant: TenantId) -> Result<Arc<TenantShard>> {
        self.tenants
            .read()
            .get(&tenant)
            .cloned()
            .ok_or(StoreError::TenantNotFound(tenant))
    }

    /// Create a new root (parentless) timeline.
    pub fn create_root(&self, tenant: TenantId, name: &str) -> Result<TimelineRecord> {
        let shard = self.shard(tenant)?;
        let mut timelines = shard.timelines.write();

        if timelines.names.contains_key(name) {
            return Err(StoreError::TimelineExists(name.to_string()));
        }

        let record = TimelineRecord {
            id: TimelineId(self.next_timeline_id.fetch_add(1, Ordering::SeqCst)),
            tenant,
            name: name.to_string(),
            parent: None,
            fork_lsn: None,
            state: TimelineState::Active,
            head: Lsn(0),
            created: Timestamp::now(),
        };

        timelines.insert(record.clone());
        Ok(record)
    }

    /// Atomically register a child of `parent` forked at `at`.
    ///
    /// Runs entirely under the tenant shard's write lock, so it linearizes
    /// with `begin_delete` on the same parent: a parent accepted for
    /// deletion is no longer a visible fork source and is reported as not
    /// found.
    pub fn create_child(
        &self,
        tenant: TenantId,
        parent: TimelineId,
        at: Lsn,
        parent_horizon: Lsn,
        name: &str,
    ) -> Result<TimelineRecord> {
        let shard = self.shard(tenant)?;
        let mut timelines = shard.timelines.write();

        let parent_record = timelines
            .records
            .get(&parent)
            .filter(|r| r.state == TimelineState::Active)
            .ok_or(StoreError::TimelineNotFound {
                timeline: parent,
                tenant,
            })?;

        if at < parent_horizon || at > parent_record.head {
            return Err(StoreError::InvalidForkPoint {
                requested: at,
                horizon: parent_horizon,
                head: parent_record.head,
            });
        }

        if timelines.names.contains_key(name) {
            return Err(StoreError::TimelineExists(name.to_string()));
        }

        let record = TimelineRecord {
            id: TimelineId(self.next_timeline_id.fetch_add(1, Ordering::SeqCst)),
            tenant,
            name: name.to_string(),
            parent: Some(parent),
            fork_lsn: Some(at),
            state: TimelineState::Active,
            head: at,
            created: Timestamp::now(),
        };

        timelines.insert(record.clone());
        Ok(record)
    }

    /// Look up a timeline record.
    pub fn get(&self, tenant: TenantId, timeline: TimelineId) -> Result<TimelineRecord> {
        let shard = self.shard(tenant)?;
        let timelines = shard.timelines.read();
        timelines
            .records
            .get(&timeline)
            .cloned()
            .ok_or(StoreError::TimelineNotFound { timeline, tenant })
    }

    /// Resolve a timeline by name.
    pub fn get_by_name(&self, tenant: TenantId, name: &str) -> Result<Option<TimelineRecord>> {
        let shard = self.shard(tenant)?;
        let timelines = shard.timelines.read();
        Ok(timelines
            .names
            .get(name)
            .and_then(|id| timelines.records.get(id))
            .cloned())
    }

    /// Ids of the non-deleted children of a timeline.
    pub fn children_of(&self, tenant: TenantId, timeline: TimelineId) -> Result<Vec<TimelineId>> {
        let shard = self.shard(tenant)?;
        let timelines = shard.timelines.read();
        if !timelines.records.contains_key(&timeline) {
            return Err(StoreError::TimelineNotFound { timeline, tenant });
        }
        Ok(timelines
            .children
            .get(&timeline)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default())
    }

    /// All timeline records of a tenant.
    pub fn list_timelines(&self, tenant: TenantId) -> Result<Vec<TimelineRecord>> {
        let shard = self.shard(tenant)?;
        let records = shard.timelines.read().records.values().cloned().collect();
        Ok(records)
    }

    /// Advance a timeline's head to `max(head, lsn)`. Returns the new head.
    pub fn update_head(&self, tenant: TenantId, timeline: TimelineId, lsn: Lsn) -> Result<Lsn> {
        let shard = self.shard(tenant)?;
        let mut timelines = shard.timelines.write();
        let record = timelines
            .records
            .get_mut(&timeline)
            .filter(|r| r.state == TimelineState::Active)
            .ok_or(StoreError::TimelineNotFound { timeline, tenant })?;
        record.head = record.head.max(lsn);
        Ok(record.head)
    }

    /// `Active -> Deleting` transition.
    ///
    /// Fails with `HasChildren` (and mutates nothing) if any non-deleted
    /// child exists. Calling it on a timeline already in `Deleting` is the
    /// retry path and succeeds.
    pub fn begin_delete(&self, tenant: TenantId, timeline: TimelineId) -> Result<()> {
        let shard = self.shard(tenant)?;
        let mut timelines = shard.timelines.write();

        let has_children = timelines
            .children
            .get(&timeline)
            .map_or(false, |c| !c.is_empty());

        let record = timelines
            .records
            .get_mut(&timeline)
            .ok_or(StoreError::TimelineNotFound { timeline, tenant })?;

        if has_children {
            return Err(StoreError::HasChildren(timeline));
        }

        record.state = TimelineState::Deleting;
        Ok(())
    }

    /// `Deleting -> Deleted`: drop the record and its index entries.
    pub fn finish_delete(&self, tenant: TenantId, timeline: TimelineId) -> Result<()> {
        let shard = self.shard(tenant)?;
        let mut timelines = shard.timelines.write();
        match timelines.records.get(&timeline) {
            Some(r) if r.state == TimelineState::Deleting => {
                timelines.remove(timeline);
                Ok(())
            }
            Some(_) => Err(StoreError::Corruption(format!(
                "finish_delete on timeline {timeline} which is not in Deleting state"
            ))),
            None => Err(StoreError::TimelineNotFound { timeline, tenant }),
        }
    }

    /// Remove a just-registered child whose store materialization failed.
    pub fn unregister(&self, tenant: TenantId, timeline: TimelineId) -> Result<()> {
        let shard = self.shard(tenant)?;
        shard.timelines.write().remove(timeline);
        Ok(())
    }
}
