//! Error types for the sync scheduler

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, SyncError>;

/// Terminal failures surfaced to `enqueue` callers and collection owners.
///
/// Admission denial, create/delete cancellation and a missing client context
/// are deliberately absent: none of them is an error.
///
/// The type is `Clone` because one outcome fans out to every waiter sharing a key.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The transport kept failing until the retry budget ran out
    #[error("mutation {key} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        key: String,
        attempts: usize,
        reason: String,
    },

    /// Pending mutation dropped by a test reset
    #[error("pending mutation {key} discarded by reset")]
    Reset { key: String },

    /// The flush task is no longer running
    #[error("sync scheduler is closed")]
    SchedulerClosed,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read or parsed
    #[error("configuration file error: {0}")]
    ConfigFile(String),

    /// A patch or server result could not be applied to a resource
    #[error("serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// Resource lookup failed
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(Arc::new(err))
    }
}

impl SyncError {
    /// The last transport failure reason, if this error carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            SyncError::RetriesExhausted { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
