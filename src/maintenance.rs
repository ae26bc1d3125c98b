//! Background maintenance: per-timeline exclusive locks and the
//! compaction worker.
//!
//! The deletion manager and the worker share one contract: a non-blocking
//! per-timeline exclusive lock. Whoever holds it has sole access to the
//! timeline's persisted artifact state; the other side fails fast (`Busy`
//! for deletion, skip-this-pass for the worker) instead of waiting.

use crate::ancestry::AncestryGraph;
use crate::artifacts::StoreRegistry;
use crate::types::{RetentionPolicy, TenantId, TimelineId, TimelineState};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Non-blocking per-timeline exclusive locks.
///
/// Implemented as a compare-and-swap flag per timeline rather than a mutex
/// table: acquisition is always a decidable busy/not-busy answer, never a
/// wait.
#[derive(Default)]
pub struct ExclusiveLocks {
    flags: RwLock<HashMap<(TenantId, TimelineId), Arc<AtomicBool>>>,
}

/// Holds a timeline's exclusive lock; released on drop.
pub struct ExclusiveGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl ExclusiveLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take exclusive access to a timeline's persisted state.
    pub fn try_acquire(&self, tenant: TenantId, timeline: TimelineId) -> Option<ExclusiveGuard> {
        let key = (tenant, timeline);
        let flag = {
            let flags = self.flags.read();
            match flags.get(&key) {
                Some(flag) => Arc::clone(flag),
                None => {
                    drop(flags);
                    Arc::clone(
                        self.flags
                            .write()
                            .entry(key)
                            .or_insert_with(|| Arc::new(AtomicBool::new(false))),
                    )
                }
            }
        };

        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ExclusiveGuard { flag })
    }

    /// Forget a deleted timeline's lock entry.
    pub fn remove(&self, tenant: TenantId, timeline: TimelineId) {
        self.flags.write().remove(&(tenant, timeline));
    }
}

/// Background compaction/GC worker.
///
/// Periodically walks the open stores and, for each timeline whose
/// exclusive lock it can take, compacts retired-artifact history per the
/// retention policy. Deletion of a timeline mid-pass is safe: it needs the
/// same lock and fails `Busy` instead.
pub struct MaintenanceWorker {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub fn spawn(
        graph: Arc<AncestryGraph>,
        stores: Arc<StoreRegistry>,
        locks: Arc<ExclusiveLocks>,
        retention: RetentionPolicy,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("lineage-maintenance".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            Self::run_pass(&graph, &stores, &locks, retention);
                        }
                    }
                }
            })
            .expect("failed to spawn maintenance thread");

        Self {
            shutdown: shutdown_tx,
            handle: Some(handle),
        }
    }

    /// One compaction pass over all open stores.
    pub fn run_pass(
        graph: &AncestryGraph,
        stores: &StoreRegistry,
        locks: &ExclusiveLocks,
        retention: RetentionPolicy,
    ) {
        let open: Vec<_> = stores
            .read()
            .iter()
            .map(|(key, store)| (*key, Arc::clone(store)))
            .collect();

        for ((tenant, timeline), store) in open {
            let record = match graph.get(tenant, timeline) {
                Ok(record) if record.state == TimelineState::Active => record,
                // Deleting or already gone: nothing to maintain.
                _ => continue,
            };

            let Some(cutoff) = retention.cutoff(record.head) else {
                continue;
            };

            let Some(_guard) = locks.try_acquire(tenant, timeline) else {
                tracing::debug!(%tenant, %timeline, "timeline busy, skipping compaction");
                continue;
            };

            match store.compact(cutoff) {
                Ok(stats) if stats.dropped > 0 => {
                    tracing::info!(
                        %tenant,
                        %timeline,
                        dropped = stats.dropped,
                        horizon = %stats.new_horizon,
                        "compaction pass"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(%tenant, %timeline, error = %e, "compaction failed");
                }
            }
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
