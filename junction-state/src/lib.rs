//! Junction State Management
//!
//! Persistence and locking for the junction reconciler.
//!
//! # Overview
//!
//! - **StateFile**: every managed network plus the template catalog
//! - **StateBackend**: a trait for state storage backends (currently a local JSON file)
//! - **StateStore**: the reconciler's `ModelsManager`, writing each state mutation through
//! - **BackendLockSet**: the reconciler's `LockSet`, one backend lock per target
//!
//! # Example
//!
//! ```ignore
//! use junction_state::{create_backend, BackendConfig, BackendLockSet, StateStore};
//!
//! let backend: Arc<dyn StateBackend> = create_backend(&BackendConfig::local("junction.state.json"))?.into();
//! let store = StateStore::open(backend.clone()).await?;
//! let locks = BackendLockSet::new(backend, "update_networking");
//!
//! Reconciler::new(&ctx, &store, &access, &locks)
//!     .update_networking(&task)
//!     .await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod state;
pub mod store;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, create_backend};
pub use lock::{BackendLockSet, LockInfo};
pub use state::{Catalog, StateFile};
pub use store::StateStore;
