//! Junction Core
//!
//! Reconciliation engine that converges a network's connectivity (route
//! tables, peering connections, transit gateway attachments and DNS resolver
//! rule associations) onto its configured templates, across accounts.

pub mod config;
pub mod context;
pub mod differ;
pub mod error;
pub mod network;
pub mod peering;
pub mod provider;
pub mod resolver;
pub mod routes;
pub mod share;
pub mod store;
pub mod task;
pub mod template;
pub mod transit_gateway;
pub mod wait;

#[cfg(test)]
mod fakes;

pub use config::ReconcilerConfig;
pub use context::{CancelToken, ReconcileContext};
pub use error::{PartialFailure, ReconcileError, ValidationError};
pub use task::{NetworkingTask, ReconcileSummary, Reconciler, ResolverRulesTask};
