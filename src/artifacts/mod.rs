//! Per-timeline derived-artifact stores.

mod store;

pub use store::{ArtifactStore, CompactionStats};

use crate::types::{TenantId, TimelineId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of the open artifact stores, keyed by tenant and timeline.
pub type StoreRegistry = RwLock<HashMap<(TenantId, TimelineId), Arc<ArtifactStore>>>;
