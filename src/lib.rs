//! # Lineage
//!
//! A multi-tenant store of branchable database timelines. Each timeline
//! carries durable, positioned derived artifacts (e.g. prepared two-phase
//! transactions) and can be forked into an independent child at any
//! retained point of its history.
//!
//! ## Core Concepts
//!
//! - **Timelines**: per-tenant branches of persisted state, forming a forest
//! - **Artifacts**: positioned records with point-in-time visibility
//! - **Forks**: point-in-time snapshot copies, isolated after creation
//! - **Deletion**: child-protected state machine, retryable under
//!   concurrent background maintenance
//!
//! ## Example
//!
//! ```ignore
//! use lineage::{Lsn, ServiceConfig, TimelineService};
//!
//! let service = TimelineService::open_or_create(ServiceConfig {
//!     path: "./my-service".into(),
//!     ..Default::default()
//! })?;
//!
//! let tenant = service.create_tenant()?;
//! let main = service.create_timeline(tenant, "main")?;
//!
//! // Prepare a transaction, then fork past it
//! service.put_artifact(tenant, main, "insert_one", Lsn(10), b"...")?;
//! let branch = service.fork_timeline(tenant, main, Lsn(10), "experiment")?;
//!
//! // Retiring on one branch never affects the other
//! service.retire_artifact(tenant, branch, "insert_one", Lsn(11))?;
//! ```

pub mod ancestry;
pub mod artifacts;
pub mod error;
pub mod maintenance;
pub mod service;
pub mod types;

// Re-exports
pub use ancestry::{AncestryGraph, TimelineRecord};
pub use artifacts::{ArtifactStore, CompactionStats, StoreRegistry};
pub use error::{Result, StoreError};
pub use maintenance::{ExclusiveGuard, ExclusiveLocks, MaintenanceWorker};
pub use service::{ServiceConfig, TimelineService};
pub use types::*;
