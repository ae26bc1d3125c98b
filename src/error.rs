//! Error types for the timeline store.

use crate::types::{Lsn, TenantId, TimelineId};
use thiserror::Error;

/// Main error type for timeline store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tenant {0} not found")]
    TenantNotFound(TenantId),

    #[error("Timeline {timeline} not found for tenant {tenant}")]
    TimelineNotFound {
        timeline: TimelineId,
        tenant: TenantId,
    },

    #[error("Timeline already exists: {0}")]
    TimelineExists(String),

    #[error("Cannot delete timeline which has child timelines")]
    HasChildren(TimelineId),

    #[error("Timeline {0} is busy: background maintenance in progress")]
    Busy(TimelineId),

    #[error("Invalid fork point {requested}: must be within [{horizon}, {head}]")]
    InvalidForkPoint {
        requested: Lsn,
        horizon: Lsn,
        head: Lsn,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,
}

impl StoreError {
    /// Whether the caller should retry the operation (transient contention
    /// with background maintenance, never a validation failure).
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            StoreError::Io(e.into())
        } else {
            StoreError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for timeline store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
