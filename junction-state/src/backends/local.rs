//! Local file backend for state storage
//!
//! This backend stores state in a local JSON file (default: junction.state.json).
//! Each lock key gets its own file next to it, e.g. `junction.state.vpc_vpc-0abc.lock`.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::lock::LockInfo;
use crate::state::StateFile;

/// Local file backend for development and single-host deployments
pub struct LocalBackend {
    state_path: PathBuf,
}

impl LocalBackend {
    /// Default state file name
    pub const DEFAULT_STATE_FILE: &'static str = "junction.state.json";

    pub fn new() -> Self {
        Self::with_path(PathBuf::from(Self::DEFAULT_STATE_FILE))
    }

    pub fn with_path(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let path = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_STATE_FILE));

        Ok(Self::with_path(path))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Path of the lock file for `key`
    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.state_path.with_extension(format!("{}.lock", key))
    }

    fn read_lock(&self, path: &Path) -> BackendResult<Option<LockInfo>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackendError::Io(format!("Failed to read lock file: {}", e)));
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| BackendError::InvalidState(format!("Failed to parse lock file: {}", e)))
    }

    fn remove_lock(&self, path: &Path) -> BackendResult<()> {
        std::fs::remove_file(path)
            .map_err(|e| BackendError::Io(format!("Failed to remove lock file: {}", e)))
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        if !self.state_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to read state file: {}", e)))?;

        let state: StateFile = serde_json::from_str(&content).map_err(|e| {
            BackendError::InvalidState(format!("Failed to parse state file: {}", e))
        })?;

        Ok(Some(state))
    }

    async fn write_state(&self, state: &StateFile) -> BackendResult<()> {
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            BackendError::Serialization(format!("Failed to serialize state: {}", e))
        })?;

        // Write to a sibling file and rename so readers never see a torn file
        let tmp_path = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;
        std::fs::rename(&tmp_path, &self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;

        Ok(())
    }

    async fn acquire_lock(&self, key: &str, operation: &str) -> BackendResult<LockInfo> {
        let path = self.lock_path(key);

        if let Some(existing) = self.read_lock(&path)? {
            if !existing.is_expired() {
                return Err(BackendError::locked(&existing));
            }
            tracing::warn!(lock = key, holder = %existing.who, "breaking expired lock");
            self.remove_lock(&path)?;
        }

        let lock = LockInfo::new(key, operation);
        let content = serde_json::to_string_pretty(&lock)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            // Lost the race against another process
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return match self.read_lock(&path)? {
                    Some(winner) => Err(BackendError::locked(&winner)),
                    None => Err(BackendError::Io(format!("Lock file {} vanished", path.display()))),
                };
            }
            Err(e) => {
                return Err(BackendError::Io(format!("Failed to write lock file: {}", e)));
            }
        };
        file.write_all(content.as_bytes())
            .map_err(|e| BackendError::Io(format!("Failed to write lock file: {}", e)))?;

        Ok(lock)
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let path = self.lock_path(&lock.key);
        let existing = self
            .read_lock(&path)?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;

        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.remove_lock(&path)
    }

    async fn force_unlock(&self, key: &str) -> BackendResult<()> {
        let path = self.lock_path(key);
        if !path.exists() {
            return Err(BackendError::LockNotFound(key.to_string()));
        }
        self.remove_lock(&path)
    }
}
