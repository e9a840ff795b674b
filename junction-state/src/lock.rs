//! Lock information and the backend-backed lock set

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use junction_core::store::{LockSet, LockTarget, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::StateBackend;

/// Default lock timeout in seconds (15 minutes)
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 900;

/// Information about a held lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// Name of the locked target (e.g., "vpc_vpc-0abc")
    pub key: String,
    /// The operation being performed (e.g., "update_networking")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(key: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::with_timeout(key, operation, DEFAULT_LOCK_TIMEOUT_SECS)
    }

    pub fn with_timeout(key: impl Into<String>, operation: impl Into<String>, timeout_secs: i64) -> Self {
        let now = Utc::now();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            operation: operation.into(),
            who: get_lock_owner(),
            created: now,
            expires: now + Duration::seconds(timeout_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    pub fn time_remaining(&self) -> Duration {
        self.expires - Utc::now()
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

/// The locks one task holds, stored through a `StateBackend`
pub struct BackendLockSet {
    backend: Arc<dyn StateBackend>,
    operation: String,
    held: Mutex<BTreeMap<LockTarget, LockInfo>>,
}

impl BackendLockSet {
    pub fn new(backend: Arc<dyn StateBackend>, operation: impl Into<String>) -> Self {
        Self {
            backend,
            operation: operation.into(),
            held: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn held_targets(&self) -> Vec<LockTarget> {
        self.held.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl LockSet for BackendLockSet {
    async fn has_lock(&self, target: &LockTarget) -> bool {
        self.held.lock().await.contains_key(target)
    }

    async fn acquire_additional(&self, target: &LockTarget) -> StoreResult<()> {
        let mut held = self.held.lock().await;
        if held.contains_key(target) {
            return Ok(());
        }
        let lock = self
            .backend
            .acquire_lock(&target.key(), &self.operation)
            .await?;
        held.insert(target.clone(), lock);
        Ok(())
    }

    async fn release(&self, target: &LockTarget) -> StoreResult<()> {
        let lock = self
            .held
            .lock()
            .await
            .remove(target)
            .ok_or_else(|| StoreError::LockNotHeld(target.key()))?;
        self.backend.release_lock(&lock).await?;
        tracing::debug!(lock = %target, "released lock");
        Ok(())
    }

    async fn release_all(&self) -> StoreResult<()> {
        let held = std::mem::take(&mut *self.held.lock().await);
        let mut first_error = None;
        for (target, lock) in held {
            match self.backend.release_lock(&lock).await {
                Ok(()) => tracing::debug!(lock = %target, "released lock"),
                Err(e) => {
                    tracing::warn!(lock = %target, error = %e, "failed to release lock");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
