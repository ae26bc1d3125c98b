//! Core types for the timeline store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unique identifier for a tenant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub u64);

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a timeline (unique within its tenant).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimelineId(pub u64);

impl fmt::Debug for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimelineId({})", self.0)
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log sequence number: position within a timeline's history.
///
/// Positions on a child timeline are only comparable to ancestor positions
/// up to the fork point.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Lsn(pub u64);

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Lsn {
    pub fn next(self) -> Self {
        Lsn(self.0 + 1)
    }

    pub fn saturating_sub(self, delta: u64) -> Self {
        Lsn(self.0.saturating_sub(delta))
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Lifecycle state of a timeline.
///
/// `Deleted` is represented by absence: once deletion completes, the record
/// and the on-disk path are both gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineState {
    /// Normal operation; valid fork source and deletion candidate.
    Active,
    /// Deletion accepted but persisted state not yet removed. No longer a
    /// valid fork source.
    Deleting,
}

/// Persisted metadata record for a timeline.
///
/// Written as `metadata.json` inside the timeline's directory; the ancestry
/// graph is rebuilt from these on startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineMetadata {
    pub id: TimelineId,
    pub tenant: TenantId,
    pub name: String,
    pub parent: Option<TimelineId>,
    pub fork_lsn: Option<Lsn>,
    pub head: Lsn,
    pub created: Timestamp,
}

/// Timeline detail returned by the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineDetail {
    pub id: TimelineId,
    pub tenant: TenantId,
    pub name: String,
    pub state: TimelineState,
    pub parent: Option<TimelineId>,
    pub fork_lsn: Option<Lsn>,
    /// Latest position this timeline has progressed to.
    pub head: Lsn,
    /// Oldest position at which `snapshot_as_of` is still answerable.
    pub horizon: Lsn,
    /// Number of artifacts currently pending (not retired).
    pub pending_artifacts: usize,
}

/// A positioned unit of auxiliary persisted state, e.g. a prepared
/// two-phase transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedArtifact {
    /// Application-assigned name (e.g. the prepared transaction's name).
    pub id: String,
    /// Position at which the artifact became visible.
    pub created_at: Lsn,
    /// Position at which it was retired (committed/aborted), if any.
    pub retired_at: Option<Lsn>,
    /// Opaque state bytes carried across forks.
    pub payload: Vec<u8>,
}

impl DerivedArtifact {
    /// Visibility rule: created at or before `at`, and not yet retired at
    /// that position.
    pub fn visible_at(&self, at: Lsn) -> bool {
        self.created_at <= at && self.retired_at.map_or(true, |r| r > at)
    }

    pub fn is_pending(&self) -> bool {
        self.retired_at.is_none()
    }
}

/// How much retired-artifact history a store keeps for past-position forks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Never forget retired artifacts; forks are answerable at any position.
    KeepAll,
    /// Compaction may drop artifacts fully retired more than this many
    /// positions behind the head, raising the store's horizon.
    WindowBehindHead(u64),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::KeepAll
    }
}

impl RetentionPolicy {
    /// Compaction cutoff for a store whose head is `head`, or `None` if
    /// nothing may be dropped.
    pub fn cutoff(&self, head: Lsn) -> Option<Lsn> {
        match *self {
            RetentionPolicy::KeepAll => None,
            RetentionPolicy::WindowBehindHead(window) => Some(head.saturating_sub(window)),
        }
    }
}

/// Caller-side retry policy for transient `Busy` failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_navigation() {
        let lsn = Lsn(5);
        assert_eq!(lsn.next(), Lsn(6));
        assert_eq!(lsn.saturating_sub(2), Lsn(3));
        assert_eq!(Lsn(1).saturating_sub(10), Lsn(0));
    }

    #[test]
    fn test_artifact_visibility() {
        let pending = DerivedArtifact {
            id: "tx".into(),
            created_at: Lsn(5),
            retired_at: None,
            payload: vec![],
        };
        assert!(!pending.visible_at(Lsn(4)));
        assert!(pending.visible_at(Lsn(5)));
        assert!(pending.visible_at(Lsn(100)));

        let retired = DerivedArtifact {
            retired_at: Some(Lsn(8)),
            ..pending.clone()
        };
        assert!(retired.visible_at(Lsn(5)));
        assert!(retired.visible_at(Lsn(7)));
        // Retirement removes visibility at the retirement position itself.
        assert!(!retired.visible_at(Lsn(8)));
        assert!(!retired.visible_at(Lsn(9)));
    }

    #[test]
    fn test_retention_cutoff() {
        assert_eq!(RetentionPolicy::KeepAll.cutoff(Lsn(100)), None);
        assert_eq!(
            RetentionPolicy::WindowBehindHead(30).cutoff(Lsn(100)),
            Some(Lsn(70))
        );
        assert_eq!(
            RetentionPolicy::WindowBehindHead(30).cutoff(Lsn(10)),
            Some(Lsn(0))
        );
    }
}
