//! Transit gateway attachments
//!
//! Templates targeting the same transit gateway merge into one desired
//! attachment: the union of their subnet types and routes. Each pass deletes
//! attachments no template wants any more, creates or repairs the rest, makes
//! sure referenced prefix lists are shared, and finally converges routes with
//! the transit gateway ID as owner key.

use std::collections::{BTreeMap, BTreeSet};

use crate::context::ReconcileContext;
use crate::error::{PartialFailure, ReconcileError, ValidationError};
use crate::network::{
    NetworkState, Region, RouteDestination, RouteOwner, StateMutation, SubnetType,
    TransitGatewayAttachment,
};
use crate::provider::{AccountAccess, AccountClients, AttachmentStatus, NetworkProvider, TransitGatewayStatus};
use crate::routes::{converge_routes, remove_owner_routes, routable_tables};
use crate::share::{ShareCoordinator, ShareRequest, ShareableKind, ShareableResource, resource_share_arn};
use crate::store::{LockSet, ModelsManager, OperableNetwork};
use crate::task::ReconcileSummary;
use crate::template::{NetworkingConfig, TransitGatewayAttachmentTemplate};
use crate::wait::{WaitTarget, await_deleted, await_status};

/// Tag listing the template IDs that contribute to an attachment
pub const TEMPLATE_IDS_TAG: &str = "junction:template-ids";

/// The merged view of every configured template for one transit gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredAttachment {
    pub transit_gateway_id: String,
    pub template_ids: BTreeSet<u64>,
    pub template_names: BTreeSet<String>,
    /// Every subnet type the templates attach, with the routes it should carry
    pub routes_by_subnet_type: BTreeMap<SubnetType, BTreeSet<RouteDestination>>,
}

impl DesiredAttachment {
    fn new(transit_gateway_id: &str) -> Self {
        Self {
            transit_gateway_id: transit_gateway_id.to_string(),
            template_ids: BTreeSet::new(),
            template_names: BTreeSet::new(),
            routes_by_subnet_type: BTreeMap::new(),
        }
    }

    pub fn subnet_types(&self) -> impl Iterator<Item = SubnetType> + '_ {
        self.routes_by_subnet_type.keys().copied()
    }

    pub fn routes_for(&self, subnet_type: SubnetType) -> Option<&BTreeSet<RouteDestination>> {
        self.routes_by_subnet_type.get(&subnet_type)
    }

    pub fn prefix_lists(&self) -> BTreeSet<String> {
        self.routes_by_subnet_type
            .values()
            .flatten()
            .filter(|d| d.is_prefix_list())
            .map(|d| d.as_str().to_string())
            .collect()
    }

    pub fn name_tag(&self, network_name: &str) -> String {
        let names: Vec<&str> = self.template_names.iter().map(String::as_str).collect();
        format!("{}-{}", network_name, names.join("/"))
    }

    pub fn template_ids_tag(&self) -> String {
        let ids: Vec<String> = self.template_ids.iter().map(|id| id.to_string()).collect();
        ids.join(",")
    }

    /// Recomputed from scratch from the current template set
    pub fn tags(&self, network_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Name".to_string(), self.name_tag(network_name)),
            (TEMPLATE_IDS_TAG.to_string(), self.template_ids_tag()),
        ])
    }
}

/// Group the configured templates by transit gateway and union them
pub fn merge_templates(
    region: &Region,
    configured: &[u64],
    catalog: &[TransitGatewayAttachmentTemplate],
) -> Result<BTreeMap<String, DesiredAttachment>, ValidationError> {
    let mut merged: BTreeMap<String, DesiredAttachment> = BTreeMap::new();
    for id in configured {
        let template = catalog
            .iter()
            .find(|t| t.id == *id)
            .ok_or(ValidationError::UnknownTemplate(*id))?;
        if &template.region != region {
            return Err(ValidationError::RegionMismatch {
                what: "Managed attachment",
                id: *id,
                expected: region.to_string(),
                actual: template.region.to_string(),
            });
        }

        let desired = merged
            .entry(template.transit_gateway_id.clone())
            .or_insert_with(|| DesiredAttachment::new(&template.transit_gateway_id));
        desired.template_ids.insert(template.id);
        desired.template_names.insert(template.name.clone());
        for subnet_type in &template.subnet_types {
            desired
                .routes_by_subnet_type
                .entry(*subnet_type)
                .or_default()
                .extend(template.routes.iter().cloned());
        }
    }
    Ok(merged)
}

/// Subnets the attachment should span: one per AZ.
///
/// The network's attachment subnet type is preferred; otherwise the first
/// attached subnet type present in the AZ, in canonical order. Unroutable
/// and firewall subnets never host an attachment.
pub fn attachment_subnet_ids(state: &NetworkState, desired: &DesiredAttachment) -> Vec<String> {
    let preferred = state.network_type.attachment_subnet_type();
    let candidates: Vec<SubnetType> = std::iter::once(preferred)
        .chain(
            desired
                .subnet_types()
                .filter(|t| *t != preferred && t.carries_transit_routes()),
        )
        .collect();

    state
        .availability_zones
        .values()
        .filter_map(|az| {
            candidates
                .iter()
                .find_map(|t| az.subnets.get(t).and_then(|subnets| subnets.first()))
                .map(|subnet| subnet.id.clone())
        })
        .collect()
}

/// A prefix list that could not be shared into the network's account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsharedPrefixList {
    pub prefix_list_id: String,
    pub owner_account: String,
}

/// Result of the attachment phase, consumed by route application
#[derive(Debug, Clone, Default)]
pub struct AttachmentRouting {
    pub desired: BTreeMap<String, DesiredAttachment>,
    pub unshared_prefix_lists: BTreeMap<String, UnsharedPrefixList>,
}

pub struct TransitGatewayReconciler<'a> {
    ctx: &'a ReconcileContext,
    catalog: &'a dyn ModelsManager,
    access: &'a dyn AccountAccess,
    locks: &'a dyn LockSet,
}

impl<'a> TransitGatewayReconciler<'a> {
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

    /// Converge the network's attachments with the configured templates
    pub async fn reconcile(
        &self,
        network: &mut OperableNetwork,
        config: &NetworkingConfig,
        summary: &mut ReconcileSummary,
    ) -> Result<AttachmentRouting, ReconcileError> {
        let templates = self.catalog.transit_gateway_templates().await?;
        let desired = merge_templates(network.region(), &config.transit_gateway_templates, &templates)?;
        let local = self
            .access
            .resolve(network.account_id(), network.region())
            .await?;

        let stale: Vec<TransitGatewayAttachment> = network
            .state()
            .transit_gateway_attachments
            .iter()
            .filter(|a| !desired.contains_key(&a.transit_gateway_id))
            .cloned()
            .collect();
        for attachment in &stale {
            self.delete_attachment(network, &local, attachment, summary)
                .await?;
        }

        for attachment in desired.values() {
            self.ensure_attachment(network, &local, attachment, summary)
                .await?;
        }

        let unshared_prefix_lists = self
            .ensure_prefix_lists_shared(network, &local, &desired, summary)
            .await?;
        Ok(AttachmentRouting {
            desired,
            unshared_prefix_lists,
        })
    }

    async fn delete_attachment(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        attachment: &TransitGatewayAttachment,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let owner = RouteOwner::TransitGateway(attachment.transit_gateway_id.clone());
        summary.routes +=
            remove_owner_routes(self.ctx, network, local.network.as_ref(), &owner, true).await?;

        match local
            .network
            .delete_transit_gateway_attachment(&attachment.attachment_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            attachment = %attachment.attachment_id,
            transit_gateway = %attachment.transit_gateway_id,
            "deleted transit gateway attachment"
        );

        let resource = format!("transit gateway attachment {}", attachment.attachment_id);
        let target = WaitTarget::new(&resource, "deleted", self.ctx.wait().attachment_timeout());
        await_deleted(
            self.ctx,
            &target,
            &[AttachmentStatus::Deleted],
            &[],
            || {
                local
                    .network
                    .transit_gateway_attachment_status(&attachment.attachment_id)
            },
        )
        .await?;

        network
            .commit(StateMutation::RemoveTransitGatewayAttachment {
                transit_gateway_id: attachment.transit_gateway_id.clone(),
            })
            .await?;
        summary.attachments_deleted += 1;
        Ok(())
    }

    async fn ensure_attachment(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        desired: &DesiredAttachment,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let tgw_id = desired.transit_gateway_id.as_str();
        let region = network.region().clone();
        let share = self.catalog.transit_gateway_share(&region, tgw_id).await?;

        let owner_clients = match &share {
            Some(s) if s.account_id != network.account_id() => {
                let owner = self.access.resolve(&s.account_id, &region).await?;
                let resources = [ShareableResource::new(
                    ShareableKind::TransitGateway,
                    tgw_id,
                    &s.account_id,
                    region.clone(),
                )];
                let request = ShareRequest {
                    resources: &resources,
                    share_name: tgw_id,
                    known_share_arn: s
                        .resource_share_id
                        .as_deref()
                        .map(|id| resource_share_arn(&region, &s.account_id, id)),
                    target_account: network.account_id(),
                };
                let outcome = ShareCoordinator::new(self.ctx, self.locks)
                    .ensure_shared(owner.share.as_ref(), local.share.as_ref(), &request)
                    .await?;
                if outcome.is_some_and(|o| o.created || o.principal_added) {
                    summary.shares_updated += 1;
                }
                Some(owner)
            }
            Some(_) => Some(local.clone()),
            None => {
                tracing::warn!(
                    transit_gateway = tgw_id,
                    "no owner recorded for transit gateway; it can only be attached if it is local or already shared"
                );
                None
            }
        };

        let subnet_ids = attachment_subnet_ids(network.state(), desired);
        let attachment_id = match network.state().transit_gateway_attachment(tgw_id).cloned() {
            Some(existing) => {
                self.update_attachment(network, local, desired, existing, subnet_ids, summary)
                    .await?
            }
            None => {
                self.create_attachment(network, local, desired, subnet_ids, summary)
                    .await?
            }
        };

        let status = wait_for_attachment(
            self.ctx,
            local.network.as_ref(),
            &attachment_id,
            "available",
            &[AttachmentStatus::Available, AttachmentStatus::PendingAcceptance],
            &[AttachmentStatus::Pending, AttachmentStatus::Modifying],
        )
        .await?;
        if status == AttachmentStatus::PendingAcceptance {
            let owner = owner_clients.ok_or_else(|| {
                ReconcileError::inconsistent(format!(
                    "Transit Gateway {} does not automatically accept attachments and no owning account is recorded. Record the owner or accept attachment {} manually and retry.",
                    tgw_id, attachment_id
                ))
            })?;
            owner
                .network
                .accept_transit_gateway_attachment(&attachment_id)
                .await?;
            tracing::info!(attachment = %attachment_id, "accepted transit gateway attachment");
            wait_for_attachment(
                self.ctx,
                local.network.as_ref(),
                &attachment_id,
                "available",
                &[AttachmentStatus::Available],
                &[AttachmentStatus::PendingAcceptance, AttachmentStatus::Pending],
            )
            .await?;
        }
        Ok(())
    }

    async fn update_attachment(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        desired: &DesiredAttachment,
        existing: TransitGatewayAttachment,
        subnet_ids: Vec<String>,
        summary: &mut ReconcileSummary,
    ) -> Result<String, ReconcileError> {
        let mut updated = existing.clone();
        let mut changed = false;
        let name = desired.name_tag(&network.network().name);

        // Tags go out before the template set is recorded so a failed write is retried
        if existing.template_ids != desired.template_ids || existing.name != name {
            local
                .network
                .tag_resource(&existing.attachment_id, &desired.tags(&network.network().name))
                .await?;
            updated.template_ids = desired.template_ids.clone();
            updated.name = name;
            network
                .commit(StateMutation::PutTransitGatewayAttachment(updated.clone()))
                .await?;
            tracing::info!(
                attachment = %existing.attachment_id,
                templates = %desired.template_ids_tag(),
                name = %updated.name,
                "updated transit gateway attachment tags"
            );
            changed = true;
        }

        let add: Vec<String> = subnet_ids
            .iter()
            .filter(|id| !existing.subnet_ids.contains(*id))
            .cloned()
            .collect();
        let remove: Vec<String> = existing
            .subnet_ids
            .iter()
            .filter(|id| !subnet_ids.contains(*id))
            .cloned()
            .collect();
        if add.is_empty() && remove.is_empty() {
            if changed {
                summary.attachments_updated += 1;
            }
            return Ok(existing.attachment_id);
        }

        local
            .network
            .modify_transit_gateway_attachment(&existing.attachment_id, &add, &remove)
            .await?;
        tracing::info!(
            attachment = %existing.attachment_id,
            add = ?add,
            remove = ?remove,
            "modified transit gateway attachment subnets"
        );
        wait_for_attachment(
            self.ctx,
            local.network.as_ref(),
            &existing.attachment_id,
            "available",
            &[AttachmentStatus::Available],
            &[AttachmentStatus::Modifying, AttachmentStatus::Pending],
        )
        .await?;

        updated.subnet_ids = subnet_ids;
        network
            .commit(StateMutation::PutTransitGatewayAttachment(updated))
            .await?;
        summary.attachments_updated += 1;
        Ok(existing.attachment_id)
    }

    async fn create_attachment(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        desired: &DesiredAttachment,
        subnet_ids: Vec<String>,
        summary: &mut ReconcileSummary,
    ) -> Result<String, ReconcileError> {
        let tgw_id = desired.transit_gateway_id.as_str();
        if subnet_ids.is_empty() {
            return Err(ReconcileError::inconsistent(format!(
                "No subnets available in {} to attach transit gateway {}",
                network.id(),
                tgw_id
            )));
        }

        // A freshly shared transit gateway takes a while to show up
        let resource = format!("transit gateway {}", tgw_id);
        let target = WaitTarget::new(&resource, "available", self.ctx.wait().transit_gateway_timeout());
        await_status(
            self.ctx,
            &target,
            &[TransitGatewayStatus::Available],
            &[],
            || local.network.transit_gateway_status(tgw_id),
        )
        .await?;

        let attachment_id = local
            .network
            .create_transit_gateway_attachment(tgw_id, network.id(), &subnet_ids)
            .await?;
        tracing::info!(
            attachment = %attachment_id,
            transit_gateway = tgw_id,
            subnets = ?subnet_ids,
            "created transit gateway attachment"
        );
        network
            .commit(StateMutation::PutTransitGatewayAttachment(
                TransitGatewayAttachment {
                    transit_gateway_id: tgw_id.to_string(),
                    attachment_id: attachment_id.clone(),
                    template_ids: desired.template_ids.clone(),
                    name: desired.name_tag(&network.network().name),
                    subnet_ids,
                },
            ))
            .await?;
        local
            .network
            .tag_resource(&attachment_id, &desired.tags(&network.network().name))
            .await?;
        summary.attachments_created += 1;
        Ok(attachment_id)
    }

    /// Prefix lists are only ever shared by hand; collect the ones that are not
    async fn ensure_prefix_lists_shared(
        &self,
        network: &OperableNetwork,
        local: &AccountClients,
        desired: &BTreeMap<String, DesiredAttachment>,
        summary: &mut ReconcileSummary,
    ) -> Result<BTreeMap<String, UnsharedPrefixList>, ReconcileError> {
        let mut unshared = BTreeMap::new();
        let prefix_lists: BTreeSet<String> =
            desired.values().flat_map(|d| d.prefix_lists()).collect();
        if prefix_lists.is_empty() {
            return Ok(unshared);
        }

        let region = network.region();
        let owner_account = self
            .ctx
            .config
            .share
            .prefix_list_account_for(region)
            .ok_or_else(|| {
                ReconcileError::inconsistent(format!(
                    "No prefix list owner account configured for {}",
                    region
                ))
            })?;
        if owner_account == network.account_id() {
            return Ok(unshared);
        }
        let owner = self.access.resolve(owner_account, region).await?;
        let coordinator = ShareCoordinator::new(self.ctx, self.locks);

        for prefix_list_id in prefix_lists {
            let resources = [ShareableResource::new(
                ShareableKind::PrefixList,
                &prefix_list_id,
                owner_account,
                region.clone(),
            )];
            let request = ShareRequest {
                resources: &resources,
                share_name: &prefix_list_id,
                known_share_arn: None,
                target_account: network.account_id(),
            };
            match coordinator
                .ensure_shared(owner.share.as_ref(), local.share.as_ref(), &request)
                .await
            {
                Ok(outcome) => {
                    if outcome.is_some_and(|o| o.principal_added) {
                        summary.shares_updated += 1;
                    }
                }
                Err(ReconcileError::UnsharedResource { .. }) => {
                    tracing::warn!(
                        prefix_list = %prefix_list_id,
                        owner = owner_account,
                        "prefix list is not shared; its routes will not be applied"
                    );
                    unshared.insert(
                        prefix_list_id.clone(),
                        UnsharedPrefixList {
                            prefix_list_id,
                            owner_account: owner_account.to_string(),
                        },
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(unshared)
    }

    /// Converge transit gateway routes in every subnet route table.
    ///
    /// Tables serving a subnet type whose routes need an unshared prefix list
    /// are skipped entirely; one error per such subnet type is returned as a
    /// partial failure after all other tables are done.
    pub async fn apply_routes(
        &self,
        network: &mut OperableNetwork,
        routing: &AttachmentRouting,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let local = self
            .access
            .resolve(network.account_id(), network.region())
            .await?;
        let mut blocked = PartialFailure::new("transit gateway route processing");
        let mut blocked_types = BTreeSet::new();

        for table in routable_tables(network.state())? {
            let subnet_types: Vec<SubnetType> = table
                .subnet_types
                .iter()
                .copied()
                .filter(|t| t.carries_transit_routes())
                .collect();
            if subnet_types.is_empty() {
                continue;
            }

            let mut table_blocked = false;
            for subnet_type in &subnet_types {
                let missing = routing
                    .desired
                    .values()
                    .filter_map(|d| d.routes_for(*subnet_type))
                    .flatten()
                    .find_map(|d| routing.unshared_prefix_lists.get(d.as_str()));
                if let Some(missing) = missing {
                    table_blocked = true;
                    if blocked_types.insert(*subnet_type) {
                        blocked.record(ReconcileError::RoutesBlocked {
                            subnet_type: *subnet_type,
                            source: Box::new(ReconcileError::UnsharedResource {
                                kind: ShareableKind::PrefixList,
                                resource_id: missing.prefix_list_id.clone(),
                                owner_account: missing.owner_account.clone(),
                            }),
                        });
                    }
                }
            }
            if table_blocked {
                continue;
            }

            for desired in routing.desired.values() {
                let destinations: BTreeSet<RouteDestination> = subnet_types
                    .iter()
                    .filter_map(|t| desired.routes_for(*t))
                    .flatten()
                    .cloned()
                    .collect();
                let owner = RouteOwner::TransitGateway(desired.transit_gateway_id.clone());
                summary.routes += converge_routes(
                    self.ctx,
                    network,
                    local.network.as_ref(),
                    &table.route_table_id,
                    &destinations,
                    &owner,
                )
                .await?;
            }
        }
        blocked.into_result()
    }
}

async fn wait_for_attachment(
    ctx: &ReconcileContext,
    provider: &dyn NetworkProvider,
    attachment_id: &str,
    expected: &str,
    terminal: &[AttachmentStatus],
    transitional: &[AttachmentStatus],
) -> Result<AttachmentStatus, ReconcileError> {
    let resource = format!("transit gateway attachment {}", attachment_id);
    let target = WaitTarget::new(&resource, expected, ctx.wait().attachment_timeout());
    await_status(ctx, &target, terminal, transitional, || {
        provider.transit_gateway_attachment_status(attachment_id)
    })
    .await
}
