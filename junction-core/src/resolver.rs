//! Resolver rule associations
//!
//! Stale and duplicate associations do not stop the pass: they are recorded
//! and returned together once every other rule set has been processed.

use std::collections::BTreeSet;

use crate::context::ReconcileContext;
use crate::error::{PartialFailure, ReconcileError, ValidationError};
use crate::network::{Region, ResolverRuleAssociation, StateMutation};
use crate::provider::{
    AccountAccess, AccountClients, ProviderError, ResolverAssociationStatus, ResolverRuleStatus,
};
use crate::share::{
    ShareCoordinator, ShareRequest, ShareableKind, ShareableResource, resolver_rule_id,
    resource_share_arn, resource_share_id,
};
use crate::store::{LockSet, ModelsManager, OperableNetwork};
use crate::task::ReconcileSummary;
use crate::template::{ManagedResolverRuleSet, ResolverRule, ResolverRulesConfig};
use crate::wait::{WaitTarget, await_deleted, await_status};

/// Look up the configured rule sets, checking they exist in the network's region
pub fn configured_rule_sets<'s>(
    region: &Region,
    config: &ResolverRulesConfig,
    catalog: &'s [ManagedResolverRuleSet],
) -> Result<Vec<&'s ManagedResolverRuleSet>, ValidationError> {
    config
        .rule_sets
        .iter()
        .map(|id| {
            let set = catalog
                .iter()
                .find(|s| s.id == *id)
                .ok_or(ValidationError::UnknownRuleSet(*id))?;
            if &set.region != region {
                return Err(ValidationError::RegionMismatch {
                    what: "Resolver rule set",
                    id: *id,
                    expected: region.to_string(),
                    actual: set.region.to_string(),
                });
            }
            Ok(set)
        })
        .collect()
}

pub struct ResolverReconciler<'a> {
    ctx: &'a ReconcileContext,
    catalog: &'a dyn ModelsManager,
    access: &'a dyn AccountAccess,
    locks: &'a dyn LockSet,
}

impl<'a> ResolverReconciler<'a> {
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

    pub async fn reconcile(
        &self,
        network: &mut OperableNetwork,
        config: &ResolverRulesConfig,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let catalog = self.catalog.resolver_rule_sets().await?;
        let configured = configured_rule_sets(network.region(), config, &catalog)?;
        let local = self
            .access
            .resolve(network.account_id(), network.region())
            .await?;
        let mut failures = PartialFailure::new("resolver rule association processing");

        let desired: BTreeSet<&str> = configured
            .iter()
            .flat_map(|set| set.rules.iter().map(|r| r.provider_id.as_str()))
            .collect();
        let removed: Vec<ResolverRuleAssociation> = network
            .state()
            .resolver_rule_associations
            .iter()
            .filter(|a| !desired.contains(a.resolver_rule_id.as_str()))
            .cloned()
            .collect();
        let mut released_rules = BTreeSet::new();
        for association in &removed {
            if self
                .disassociate(network, &local, association, &mut failures, summary)
                .await?
            {
                released_rules.insert(association.resolver_rule_id.clone());
            }
        }

        // Shares the configured rule sets depend on, as recorded or as found this pass
        let mut kept_shares: BTreeSet<String> = configured
            .iter()
            .filter_map(|set| share_arn_of(set))
            .collect();
        for set in &configured {
            if let Some(share_arn) = self
                .ensure_rule_set(network, &local, set, &mut failures, summary)
                .await?
            {
                kept_shares.insert(share_arn);
            }
        }

        let configured_ids: BTreeSet<u64> = configured.iter().map(|s| s.id).collect();
        let mut released_shares = BTreeSet::new();
        for set in catalog.iter().filter(|s| !configured_ids.contains(&s.id)) {
            if !set
                .rules
                .iter()
                .any(|r| released_rules.contains(&r.provider_id))
            {
                continue;
            }
            let Some(share_arn) = share_arn_of(set) else {
                continue;
            };
            if kept_shares.contains(&share_arn) {
                tracing::debug!(
                    rule_set = set.id,
                    share = %share_arn,
                    "share still carries configured rule sets"
                );
                continue;
            }
            if !released_shares.insert(share_arn.clone()) {
                continue;
            }
            if let Err(e) = self
                .release_share(network, &local, set, &share_arn, summary)
                .await
            {
                failures.record(e);
            }
        }

        failures.into_result()
    }

    /// Returns whether the association is gone from state afterwards
    async fn disassociate(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        association: &ResolverRuleAssociation,
        failures: &mut PartialFailure,
        summary: &mut ReconcileSummary,
    ) -> Result<bool, ReconcileError> {
        let rule_id = association.resolver_rule_id.as_str();
        match local
            .resolver
            .disassociate_resolver_rule(rule_id, network.id())
            .await
        {
            Ok(()) => {
                tracing::info!(rule = rule_id, network = network.id(), "disassociated resolver rule");
                let resource = format!("resolver rule association {}", association.association_id);
                let target = WaitTarget::new(&resource, "deleted", self.ctx.wait().resolver_timeout());
                await_deleted(self.ctx, &target, &[], &[], || {
                    local
                        .resolver
                        .resolver_rule_association_status(&association.association_id)
                })
                .await?;
                summary.associations_deleted += 1;
            }
            Err(e) if e.is_not_found() => {
                failures.record(e.for_resource(rule_id).into());
            }
            Err(e) => {
                failures.record(e.for_resource(rule_id).into());
                return Ok(false);
            }
        }
        network
            .commit(StateMutation::RemoveResolverRuleAssociation {
                resolver_rule_id: rule_id.to_string(),
            })
            .await?;
        Ok(true)
    }

    /// Returns the ARN of the share exposing the set, when it is cross-account
    async fn ensure_rule_set(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        set: &ManagedResolverRuleSet,
        failures: &mut PartialFailure,
        summary: &mut ReconcileSummary,
    ) -> Result<Option<String>, ReconcileError> {
        let mut share_arn = None;
        if set.account_id != network.account_id() {
            let owner = self.access.resolve(&set.account_id, &set.region).await?;
            let resources: Vec<ShareableResource> = set
                .rules
                .iter()
                .map(|r| {
                    ShareableResource::new(
                        ShareableKind::ResolverRule,
                        &r.provider_id,
                        &set.account_id,
                        set.region.clone(),
                    )
                })
                .collect();
            let request = ShareRequest {
                resources: &resources,
                share_name: &set.name,
                known_share_arn: set
                    .resource_share_id
                    .as_deref()
                    .map(|id| resource_share_arn(&set.region, &set.account_id, id)),
                target_account: network.account_id(),
            };
            let outcome = ShareCoordinator::new(self.ctx, self.locks)
                .ensure_shared(owner.share.as_ref(), local.share.as_ref(), &request)
                .await?;
            if let Some(outcome) = outcome {
                let share_id = resource_share_id(&outcome.share_arn);
                if set.resource_share_id.as_deref() != Some(share_id) {
                    self.catalog.record_resource_share(set.id, share_id).await?;
                }
                if outcome.created || outcome.principal_added {
                    summary.shares_updated += 1;
                }
                share_arn = Some(outcome.share_arn);
            }
        }

        for rule in &set.rules {
            self.ensure_association(network, local, rule, failures, summary)
                .await?;
        }
        Ok(share_arn)
    }

    async fn ensure_association(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        rule: &ResolverRule,
        failures: &mut PartialFailure,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let rule_id = rule.provider_id.as_str();

        if let Some(existing) = network.state().resolver_rule_association(rule_id).cloned() {
            let vanished = match local
                .resolver
                .resolver_rule_association_status(&existing.association_id)
                .await
            {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(e.into()),
            };
            if vanished {
                failures.record(
                    ProviderError::not_found(format!(
                        "Resolver rule association {} no longer exists",
                        existing.association_id
                    ))
                    .for_resource(rule_id)
                    .into(),
                );
                network
                    .commit(StateMutation::RemoveResolverRuleAssociation {
                        resolver_rule_id: rule_id.to_string(),
                    })
                    .await?;
            }
            return Ok(());
        }

        // A freshly shared rule takes a moment to become usable
        let resource = format!("resolver rule {}", rule_id);
        let target = WaitTarget::new(&resource, "complete", self.ctx.wait().resolver_timeout());
        await_status(
            self.ctx,
            &target,
            &[ResolverRuleStatus::Complete],
            &[ResolverRuleStatus::Creating, ResolverRuleStatus::Updating],
            || local.resolver.resolver_rule_status(rule_id),
        )
        .await?;

        let association_id = match local
            .resolver
            .associate_resolver_rule(rule_id, network.id())
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_already_exists() => {
                failures.record(e.for_resource(rule_id).into());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            rule = rule_id,
            association = %association_id,
            network = network.id(),
            "associated resolver rule"
        );
        network
            .commit(StateMutation::PutResolverRuleAssociation(
                ResolverRuleAssociation {
                    resolver_rule_id: rule_id.to_string(),
                    association_id: association_id.clone(),
                },
            ))
            .await?;

        let resource = format!("resolver rule association {}", association_id);
        let target = WaitTarget::new(&resource, "complete", self.ctx.wait().resolver_timeout());
        await_status(
            self.ctx,
            &target,
            &[ResolverAssociationStatus::Complete],
            &[ResolverAssociationStatus::Creating],
            || local.resolver.resolver_rule_association_status(&association_id),
        )
        .await?;
        summary.associations_created += 1;
        Ok(())
    }

    /// Drop this account from a rule set's share once nothing here uses
    /// any rule the share carries
    async fn release_share(
        &self,
        network: &OperableNetwork,
        local: &AccountClients,
        set: &ManagedResolverRuleSet,
        share_arn: &str,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        if set.account_id == network.account_id() {
            return Ok(());
        }
        if set.in_use_networks.iter().any(|n| n != network.id()) {
            tracing::debug!(rule_set = set.id, "rule set still in use by other networks");
            return Ok(());
        }

        let owner = self.access.resolve(&set.account_id, &set.region).await?;
        let shared = owner.share.share_resources(share_arn).await?;
        let rule_ids: BTreeSet<&str> = set
            .rules
            .iter()
            .map(|r| r.provider_id.as_str())
            .chain(shared.iter().filter_map(|arn| resolver_rule_id(arn)))
            .collect();
        for rule_id in rule_ids {
            if local
                .resolver
                .resolver_rule_association_count(rule_id)
                .await?
                > 0
            {
                tracing::debug!(
                    rule = rule_id,
                    share = share_arn,
                    "rule still associated in this account; keeping share"
                );
                return Ok(());
            }
        }

        if ShareCoordinator::new(self.ctx, self.locks)
            .unshare(owner.share.as_ref(), share_arn, network.account_id())
            .await?
        {
            summary.shares_updated += 1;
        }
        Ok(())
    }
}

/// Recorded share of a cross-account rule set
fn share_arn_of(set: &ManagedResolverRuleSet) -> Option<String> {
    set.resource_share_id
        .as_deref()
        .map(|id| resource_share_arn(&set.region, &set.account_id, id))
}
