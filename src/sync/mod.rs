//! Synchronization module for the shared seating plan.
//!
//! This module implements best-effort multi-client synchronization over a
//! realtime document store. It provides:
//! - Session lifecycle and presence records
//! - Debounced whole-document pushes with no-op suppression
//! - Heuristic per-table merging of incoming remote documents
//! - Diagnostics comparing the local plan with the remote document

pub mod diagnostics;
pub mod engine;
pub mod merge;
pub mod session;

pub use diagnostics::{SyncReport, TableReport, TableStatus};
pub use engine::{IgnoreReason, MergeOutcome, SyncEngine};
pub use session::{OnlineUser, SessionConfig, SessionManager};

use std::time::Duration;
use thiserror::Error;

use crate::model::ModelError;
use crate::storage::StoreError;

/// Path of the shared seating-plan document
pub const DOCUMENT_PATH: &str = "seatingPlan";

/// Path under which presence records live
pub const PRESENCE_PATH: &str = "presence";

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Error)]
pub enum SyncError {
    /// No session has been started
    #[error("No active session")]
    NoSession,
    /// Remote store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// Local model rejected an operation
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    /// Document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Store path of the shared document
    pub document_path: String,
    /// Quiet period before a scheduled push writes
    pub push_debounce: Duration,
    /// Minimum spacing between applied remote updates
    pub merge_cooldown: Duration,
    /// How long pushes stay blocked after a remote update is applied
    pub guard_release: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            document_path: DOCUMENT_PATH.to_string(),
            push_debounce: Duration::from_millis(300),
            merge_cooldown: Duration::from_millis(1000),
            guard_release: Duration::from_millis(1000),
        }
    }
}

impl SyncConfig {
    pub fn with_push_debounce(mut self, debounce: Duration) -> Self {
        self.push_debounce = debounce;
        self
    }

    pub fn with_merge_cooldown(mut self, cooldown: Duration) -> Self {
        self.merge_cooldown = cooldown;
        self
    }

    pub fn with_guard_release(mut self, release: Duration) -> Self {
        self.guard_release = release;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::Model(ModelError::TableNotFound("t1".to_string()));
        assert_eq!(err.to_string(), "Model error: Table not found: t1");
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.document_path, "seatingPlan");
        assert_eq!(config.push_debounce, Duration::from_millis(300));
        assert_eq!(config.merge_cooldown, Duration::from_secs(1));
    }
}
