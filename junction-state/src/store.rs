//! Models manager over a state backend
//!
//! The whole state file is cached in memory. Every write goes through one
//! mutex: the mutation is applied to a copy, the serial bumped, the copy
//! written back, and only then does the cache take the new version.

use std::sync::Arc;

use async_trait::async_trait;
use junction_core::network::{Network, Region, StateMutation};
use junction_core::store::{
    LockSet, LockTarget, ModelsManager, OperableNetwork, StateWriter, StoreError, StoreResult,
};
use junction_core::template::{ManagedResolverRuleSet, TransitGatewayAttachmentTemplate, TransitGatewayShare};
use tokio::sync::Mutex;

use crate::backend::{BackendError, BackendResult, StateBackend};
use crate::state::StateFile;

struct StoreInner {
    backend: Arc<dyn StateBackend>,
    state: Mutex<StateFile>,
}

impl StoreInner {
    /// Apply `edit` to a copy of the state and persist it
    async fn update<T>(&self, edit: impl FnOnce(&mut StateFile) -> StoreResult<T>) -> StoreResult<T> {
        let mut cached = self.state.lock().await;
        let mut next = cached.clone();
        let value = edit(&mut next)?;
        next.increment_serial();

        if let Some(current) = self.backend.read_state().await?
            && current.lineage != next.lineage
        {
            return Err(BackendError::LineageMismatch {
                expected: next.lineage.clone(),
                actual: current.lineage,
            }
            .into());
        }
        self.backend.write_state(&next).await?;
        *cached = next;
        Ok(value)
    }
}

/// `ModelsManager` persisting to a `StateBackend`
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Load the state, starting an empty one on first use
    pub async fn open(backend: Arc<dyn StateBackend>) -> BackendResult<Self> {
        let state = match backend.read_state().await? {
            Some(state) => state,
            None => StateFile::new(),
        };
        Ok(Self {
            inner: Arc::new(StoreInner {
                backend,
                state: Mutex::new(state),
            }),
        })
    }

    pub async fn snapshot(&self) -> StateFile {
        self.inner.state.lock().await.clone()
    }

    pub async fn network(&self, region: &Region, network_id: &str) -> Option<Network> {
        self.inner
            .state
            .lock()
            .await
            .find_network(region, network_id)
            .cloned()
    }

    /// Register or replace a network's persisted model
    pub async fn put_network(&self, network: Network) -> StoreResult<()> {
        self.inner
            .update(|state| {
                state.upsert_network(network);
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl ModelsManager for StateStore {
    async fn operable_network(
        &self,
        locks: &dyn LockSet,
        region: &Region,
        network_id: &str,
    ) -> StoreResult<OperableNetwork> {
        let target = LockTarget::Network(network_id.to_string());
        if !locks.has_lock(&target).await {
            return Err(StoreError::LockNotHeld(target.key()));
        }
        let network = self
            .network(region, network_id)
            .await
            .ok_or_else(|| StoreError::NetworkNotFound {
                region: region.clone(),
                network_id: network_id.to_string(),
            })?;
        let writer = Arc::new(NetworkWriter {
            inner: self.inner.clone(),
            region: region.clone(),
            network_id: network_id.to_string(),
        });
        Ok(OperableNetwork::new(network, writer))
    }

    async fn transit_gateway_templates(&self) -> StoreResult<Vec<TransitGatewayAttachmentTemplate>> {
        Ok(self
            .inner
            .state
            .lock()
            .await
            .catalog
            .transit_gateway_templates
            .clone())
    }

    async fn resolver_rule_sets(&self) -> StoreResult<Vec<ManagedResolverRuleSet>> {
        Ok(self.inner.state.lock().await.catalog.resolver_rule_sets.clone())
    }

    async fn transit_gateway_share(
        &self,
        region: &Region,
        transit_gateway_id: &str,
    ) -> StoreResult<Option<TransitGatewayShare>> {
        Ok(self
            .inner
            .state
            .lock()
            .await
            .catalog
            .transit_gateway_share(region, transit_gateway_id)
            .cloned())
    }

    async fn record_resource_share(&self, rule_set_id: u64, share_id: &str) -> StoreResult<()> {
        self.inner
            .update(|state| {
                let set = state
                    .catalog
                    .rule_set_mut(rule_set_id)
                    .ok_or(StoreError::RuleSetNotFound(rule_set_id))?;
                set.resource_share_id = Some(share_id.to_string());
                Ok(())
            })
            .await?;
        tracing::debug!(rule_set_id, share_id, "recorded resource share");
        Ok(())
    }
}

/// Persists one network's mutations into the shared state file
struct NetworkWriter {
    inner: Arc<StoreInner>,
    region: Region,
    network_id: String,
}

#[async_trait]
impl StateWriter for NetworkWriter {
    async fn apply(&self, mutation: &StateMutation) -> StoreResult<()> {
        self.inner
            .update(|state| {
                let network = state
                    .find_network_mut(&self.region, &self.network_id)
                    .ok_or_else(|| StoreError::NetworkNotFound {
                        region: self.region.clone(),
                        network_id: self.network_id.clone(),
                    })?;
                network.state.apply(mutation);
                Ok(())
            })
            .await
    }
}
