//! State backend trait and error types

use std::collections::HashMap;

use async_trait::async_trait;
use junction_core::store::StoreError;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::StateFile;

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The lock is held by another process
    #[error("Lock {key} is held by {who} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        key: String,
        lock_id: String,
        who: String,
        operation: String,
    },

    /// The lock was not found (for release/force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// State file is corrupted or invalid
    #[error("Invalid state file: {0}")]
    InvalidState(String),

    /// State lineage mismatch (prevents accidental state overwrites)
    #[error("State lineage mismatch: expected {expected}, got {actual}")]
    LineageMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            key: lock.key.clone(),
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }

    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<BackendError> for StoreError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Locked { key, .. } => StoreError::LockHeld(key),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for state storage backends
///
/// Stores the single state file and one lock per named key. Keys are the
/// `LockTarget` keys of the reconciler (e.g., `vpc_vpc-0abc`, `ram_add`).
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the current state from the backend
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn read_state(&self) -> BackendResult<Option<StateFile>>;

    /// Write the state to the backend
    ///
    /// The state's serial number should be incremented before calling this
    async fn write_state(&self, state: &StateFile) -> BackendResult<()>;

    /// Acquire the lock named `key`
    ///
    /// Fails with `Locked` while another holder's lock has not expired
    async fn acquire_lock(&self, key: &str, operation: &str) -> BackendResult<LockInfo>;

    /// Release a previously acquired lock, verifying it is still ours
    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Force release a lock regardless of holder
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, key: &str) -> BackendResult<()>;
}

/// Configuration for a state backend
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Backend type (currently only "local")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, String>,
}

impl BackendConfig {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            backend_type: "local".to_string(),
            attributes: [("path".to_string(), path.into())].into_iter().collect(),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}
