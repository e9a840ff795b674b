//! Store - Persistence and locking ports
//!
//! The reconcilers read networks and the template catalog through
//! `ModelsManager`, persist each incremental change through a per-network
//! `StateWriter`, and coordinate with other passes through a `LockSet`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ReconcileError;
use crate::network::{Network, NetworkState, Region, StateMutation};
use crate::template::{ManagedResolverRuleSet, TransitGatewayAttachmentTemplate, TransitGatewayShare};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Network {network_id} in {region} not found")]
    NetworkNotFound { region: Region, network_id: String },

    #[error("Lock {0} is held by another task")]
    LockHeld(String),

    #[error("Lock {0} is not held by this task")]
    LockNotHeld(String),

    #[error("Resolver rule set {0} not found")]
    RuleSetNotFound(u64),

    #[error("State backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Named lock targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockTarget {
    Network(String),
    /// Serializes every mutation of a resource share's principals or resources
    AddResourceShare,
    Task(u64),
}

impl LockTarget {
    pub fn key(&self) -> String {
        match self {
            LockTarget::Network(id) => format!("vpc_{}", id),
            LockTarget::AddResourceShare => "ram_add".to_string(),
            LockTarget::Task(id) => format!("task_{}", id),
        }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[async_trait]
pub trait LockSet: Send + Sync {
    async fn has_lock(&self, target: &LockTarget) -> bool;

    /// Acquire another lock on top of the ones already held
    async fn acquire_additional(&self, target: &LockTarget) -> StoreResult<()>;

    async fn release(&self, target: &LockTarget) -> StoreResult<()>;

    async fn release_all(&self) -> StoreResult<()>;
}

/// Acquire `target` unless it is already held. Returns whether it was acquired here.
pub async fn ensure_lock(locks: &dyn LockSet, target: &LockTarget) -> StoreResult<bool> {
    if locks.has_lock(target).await {
        return Ok(false);
    }
    locks.acquire_additional(target).await?;
    tracing::debug!(lock = %target, "acquired lock");
    Ok(true)
}

/// Persists incremental edits to one network's state
#[async_trait]
pub trait StateWriter: Send + Sync {
    async fn apply(&self, mutation: &StateMutation) -> StoreResult<()>;
}

/// Read port onto persisted networks and the template catalog
#[async_trait]
pub trait ModelsManager: Send + Sync {
    /// Load a network for mutation. The network's lock must already be held.
    async fn operable_network(
        &self,
        locks: &dyn LockSet,
        region: &Region,
        network_id: &str,
    ) -> StoreResult<OperableNetwork>;

    async fn transit_gateway_templates(&self) -> StoreResult<Vec<TransitGatewayAttachmentTemplate>>;

    async fn resolver_rule_sets(&self) -> StoreResult<Vec<ManagedResolverRuleSet>>;

    async fn transit_gateway_share(
        &self,
        region: &Region,
        transit_gateway_id: &str,
    ) -> StoreResult<Option<TransitGatewayShare>>;

    /// Remember the share that now exposes a rule set
    async fn record_resource_share(&self, rule_set_id: u64, share_id: &str) -> StoreResult<()>;
}

/// A loaded network paired with the writer that persists its changes
pub struct OperableNetwork {
    network: Network,
    writer: Arc<dyn StateWriter>,
}

impl OperableNetwork {
    pub fn new(network: Network, writer: Arc<dyn StateWriter>) -> Self {
        Self { network, writer }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn state(&self) -> &NetworkState {
        &self.network.state
    }

    pub fn id(&self) -> &str {
        &self.network.id
    }

    pub fn account_id(&self) -> &str {
        &self.network.account_id
    }

    pub fn region(&self) -> &Region {
        &self.network.region
    }

    /// Persist the mutation, then mirror it in memory
    pub async fn commit(&mut self, mutation: StateMutation) -> Result<(), ReconcileError> {
        self.writer.apply(&mutation).await?;
        self.network.state.apply(&mutation);
        Ok(())
    }
}
