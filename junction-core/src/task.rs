//! Task - One reconciliation pass for one network
//!
//! A networking pass validates everything it can up front, records route
//! drift, converges transit gateway attachments and peering connections, and
//! only then touches routes. The network's lock is held for the whole pass.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::context::ReconcileContext;
use crate::differ::RoutePlanSummary;
use crate::error::ReconcileError;
use crate::network::Region;
use crate::peering::PeeringReconciler;
use crate::provider::AccountAccess;
use crate::resolver::ResolverReconciler;
use crate::routes::refresh_route_tables;
use crate::store::{LockSet, LockTarget, ModelsManager, OperableNetwork, ensure_lock};
use crate::template::{NetworkingConfig, ResolverRulesConfig};
use crate::transit_gateway::{TransitGatewayReconciler, merge_templates};

/// Desired networking for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkingTask {
    pub region: Region,
    pub network_id: String,
    #[serde(default)]
    pub config: NetworkingConfig,
}

/// Desired resolver rule sets for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverRulesTask {
    pub region: Region,
    pub network_id: String,
    #[serde(default)]
    pub config: ResolverRulesConfig,
}

/// What a pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub routes: RoutePlanSummary,
    pub drift_recorded: usize,
    pub attachments_created: usize,
    pub attachments_updated: usize,
    pub attachments_deleted: usize,
    pub peerings_created: usize,
    pub peerings_deleted: usize,
    pub associations_created: usize,
    pub associations_deleted: usize,
    pub shares_updated: usize,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}. Attachments: {} created, {} updated, {} deleted. Peering connections: {} created, {} deleted. Resolver rules: {} associated, {} disassociated. Shares: {} updated",
            self.routes,
            self.attachments_created,
            self.attachments_updated,
            self.attachments_deleted,
            self.peerings_created,
            self.peerings_deleted,
            self.associations_created,
            self.associations_deleted,
            self.shares_updated
        )
    }
}

/// Entry point for reconciliation tasks
pub struct Reconciler<'a> {
    ctx: &'a ReconcileContext,
    catalog: &'a dyn ModelsManager,
    access: &'a dyn AccountAccess,
    locks: &'a dyn LockSet,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ctx: &'a ReconcileContext,
        catalog: &'a dyn ModelsManager,
        access: &'a dyn AccountAccess,
        locks: &'a dyn LockSet,
    ) -> Self {
        Self {
            ctx,
            catalog,
            access,
            locks,
        }
    }

    pub async fn update_networking(
        &self,
        task: &NetworkingTask,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let span = tracing::info_span!(
            parent: self.ctx.span(),
            "update_networking",
            network = %task.network_id,
            region = %task.region
        );
        async {
            let network = self.open_network(&task.region, &task.network_id).await?;
            let result = self.networking(network, &task.config).await;
            self.finish(result).await
        }
        .instrument(span)
        .await
    }

    pub async fn update_resolver_rules(
        &self,
        task: &ResolverRulesTask,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let span = tracing::info_span!(
            parent: self.ctx.span(),
            "update_resolver_rules",
            network = %task.network_id,
            region = %task.region
        );
        async {
            let mut network = self.open_network(&task.region, &task.network_id).await?;
            let mut summary = ReconcileSummary::default();
            let result = ResolverReconciler::new(self.ctx, self.catalog, self.access, self.locks)
                .reconcile(&mut network, &task.config, &mut summary)
                .await
                .map(|()| summary);
            self.finish(result).await
        }
        .instrument(span)
        .await
    }

    async fn open_network(
        &self,
        region: &Region,
        network_id: &str,
    ) -> Result<OperableNetwork, ReconcileError> {
        self.ctx.check_live()?;
        ensure_lock(self.locks, &LockTarget::Network(network_id.to_string())).await?;
        match self
            .catalog
            .operable_network(self.locks, region, network_id)
            .await
        {
            Ok(network) => Ok(network),
            Err(e) => {
                self.release_locks().await;
                Err(e.into())
            }
        }
    }

    async fn networking(
        &self,
        mut network: OperableNetwork,
        config: &NetworkingConfig,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let mut summary = ReconcileSummary::default();

        // Everything that can be rejected is rejected before the first call
        let templates = self.catalog.transit_gateway_templates().await?;
        merge_templates(network.region(), &config.transit_gateway_templates, &templates)?;
        let peering = PeeringReconciler::new(self.ctx, self.catalog, self.access, self.locks);
        let plan = peering.prepare(&network, config).await?;

        let local = self
            .access
            .resolve(network.account_id(), network.region())
            .await?;
        summary.drift_recorded =
            refresh_route_tables(self.ctx, &mut network, local.network.as_ref()).await?;

        let transit = TransitGatewayReconciler::new(self.ctx, self.catalog, self.access, self.locks);
        let routing = transit.reconcile(&mut network, config, &mut summary).await?;
        let mut links = peering.reconcile(&mut network, plan, &mut summary).await?;

        // Blocked transit gateway routes must not hold back peering routes
        let blocked = match transit.apply_routes(&mut network, &routing, &mut summary).await {
            Ok(()) => None,
            Err(e) if e.is_incomplete() => Some(e),
            Err(e) => return Err(e),
        };
        peering
            .apply_routes(&mut network, &mut links, &mut summary)
            .await?;

        match blocked {
            Some(e) => {
                tracing::warn!(summary = %summary, "networking pass incomplete");
                Err(e)
            }
            None => Ok(summary),
        }
    }

    async fn finish(
        &self,
        result: Result<ReconcileSummary, ReconcileError>,
    ) -> Result<ReconcileSummary, ReconcileError> {
        if let Ok(summary) = &result {
            if summary.is_empty() {
                tracing::info!("no changes");
            } else {
                tracing::info!(summary = %summary, "reconciled");
            }
        }
        match self.locks.release_all().await {
            Ok(()) => result,
            Err(e) if result.is_ok() => Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "failed to release locks");
                result
            }
        }
    }

    async fn release_locks(&self) {
        if let Err(e) = self.locks.release_all().await {
            tracing::warn!(error = %e, "failed to release locks");
        }
    }
}
