//! In-memory cloud, store and locks for tests
//!
//! One `FakeCloud` holds every account's resources plus the persisted
//! networks and catalog, so a test can drive several accounts and inspect
//! the result from one place. Every mutating provider call is logged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::ReconcilerConfig;
use crate::context::ReconcileContext;
use crate::network::{
    AvailabilityZone, Network, NetworkState, NetworkType, Region, Route, RouteDestination, RouteOwner,
    RouteTable, RouteTableAssociation, StateMutation, Subnet, SubnetType,
};
use crate::provider::{
    AccountAccess, AccountClients, AttachmentStatus, NetworkProvider, ObservedRoute,
    ObservedRouteTable, PeeringRequest, PeeringStatus, ProviderError, ProviderResult,
    ResolverAssociationStatus, ResolverProvider, ResolverRuleStatus, ShareProvider, ShareStatus,
    TransitGatewayStatus,
};
use crate::share::resource_share_arn;
use crate::store::{
    LockSet, LockTarget, ModelsManager, OperableNetwork, StateWriter, StoreError, StoreResult,
    ensure_lock,
};
use crate::template::{ManagedResolverRuleSet, TransitGatewayAttachmentTemplate, TransitGatewayShare};
use crate::wait::ManualClock;

pub fn test_context() -> (ReconcileContext, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let ctx = ReconcileContext::new(ReconcilerConfig::default()).with_clock(clock.clone());
    (ctx, clock)
}

struct FakeTransitGateway {
    owner: String,
    auto_accept: bool,
}

struct FakeAttachment {
    transit_gateway_id: String,
    subnet_ids: Vec<String>,
    status: AttachmentStatus,
}

struct FakePeering {
    accepter_account: String,
    status: PeeringStatus,
}

struct FakeShare {
    owner: String,
    resources: Vec<String>,
    principals: Vec<String>,
    accepted: BTreeSet<String>,
}

struct FakeAssociation {
    account: String,
    rule_id: String,
    network_id: String,
}

#[derive(Default)]
struct World {
    calls: Vec<(String, String)>,
    next_id: u64,
    config: ReconcilerConfig,

    networks: BTreeMap<String, Network>,
    templates: Vec<TransitGatewayAttachmentTemplate>,
    rule_sets: Vec<ManagedResolverRuleSet>,
    transit_gateway_shares: Vec<TransitGatewayShare>,

    route_tables: BTreeMap<String, BTreeMap<String, Route>>,
    subnet_cidrs: BTreeMap<String, String>,
    network_subnets: BTreeMap<String, Vec<String>>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
    transit_gateways: BTreeMap<String, FakeTransitGateway>,
    attachments: BTreeMap<String, FakeAttachment>,
    stuck_attachments: Option<AttachmentStatus>,
    failing_tag_writes: u32,
    peerings: BTreeMap<String, FakePeering>,
    shares: BTreeMap<String, FakeShare>,
    invitations: BTreeMap<String, (String, String)>,
    organization_sharing: bool,
    resolver_rules: BTreeMap<String, String>,
    associations: BTreeMap<String, FakeAssociation>,
}

impl World {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

#[derive(Clone, Default)]
pub struct FakeCloud {
    world: Arc<Mutex<World>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    /// Provider handle acting as `account_id`
    pub fn account(&self, account_id: &str, region: &str) -> FakeAccount {
        FakeAccount {
            cloud: self.clone(),
            account_id: account_id.to_string(),
            region: Region::new(region),
        }
    }

    pub fn store(&self) -> MemoryStore {
        MemoryStore {
            cloud: self.clone(),
        }
    }

    /// Persist the network and create its route tables and subnets
    pub fn register(&self, network: Network) {
        let mut world = self.world();
        let index = world.networks.len() + 1;
        let mut subnet_ids = Vec::new();
        for (k, (_, _, subnet)) in network.state.subnets().enumerate() {
            world
                .subnet_cidrs
                .insert(subnet.id.clone(), format!("10.{}.{}.0/24", index, k));
            subnet_ids.push(subnet.id.clone());
        }
        world.network_subnets.insert(network.id.clone(), subnet_ids);
        for rt_id in network.state.route_tables.keys() {
            world.route_tables.entry(rt_id.clone()).or_default();
        }
        world.networks.insert(network.id.clone(), network);
    }

    /// Register the network and hand it out without going through locks
    pub fn operable(&self, network: Network) -> (MemoryStore, OperableNetwork) {
        let id = network.id.clone();
        self.register(network.clone());
        let writer = Arc::new(MemoryWriter {
            cloud: self.clone(),
            network_id: id,
        });
        (self.store(), OperableNetwork::new(network, writer))
    }

    /// Lock and load a registered network
    pub async fn open(&self, store: &MemoryStore, locks: &MemoryLocks, network_id: &str) -> OperableNetwork {
        let region = self.world().networks[network_id].region.clone();
        ensure_lock(locks, &LockTarget::Network(network_id.to_string()))
            .await
            .unwrap();
        store.operable_network(locks, &region, network_id).await.unwrap()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.world().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn mutations_by(&self, account_id: &str) -> Vec<String> {
        self.world()
            .calls
            .iter()
            .filter(|(a, _)| a == account_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        self.world().config.clone()
    }

    pub fn set_prefix_list_owner(&self, account_id: &str) {
        self.world().config.share.prefix_list_account = Some(account_id.to_string());
    }

    pub fn set_organization_sharing(&self, enabled: bool) {
        self.world().organization_sharing = enabled;
    }

    // Catalog

    pub fn add_template(&self, template: TransitGatewayAttachmentTemplate) {
        self.world().templates.push(template);
    }

    pub fn add_rule_set(&self, rule_set: ManagedResolverRuleSet) {
        self.world().rule_sets.push(rule_set);
    }

    pub fn add_transit_gateway_share(&self, share: TransitGatewayShare) {
        self.world().transit_gateway_shares.push(share);
    }

    // Routes and subnets

    pub fn routes(&self, route_table_id: &str) -> Vec<Route> {
        self.world()
            .route_tables
            .get(route_table_id)
            .map(|routes| routes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn route_table_ids(&self) -> Vec<String> {
        self.world().route_tables.keys().cloned().collect()
    }

    pub fn seed_route(&self, route_table_id: &str, route: Route) {
        self.world()
            .route_tables
            .entry(route_table_id.to_string())
            .or_default()
            .insert(route.destination.to_string(), route);
    }

    /// Sorted CIDRs of every subnet in the network
    pub fn subnet_cidrs(&self, network_id: &str) -> Vec<String> {
        let world = self.world();
        let mut cidrs: Vec<String> = world
            .network_subnets
            .get(network_id)
            .into_iter()
            .flatten()
            .filter_map(|id| world.subnet_cidrs.get(id).cloned())
            .collect();
        cidrs.sort();
        cidrs
    }

    pub fn tags(&self, resource_id: &str) -> BTreeMap<String, String> {
        self.world()
            .tags
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    // Transit gateways

    pub fn add_transit_gateway(&self, transit_gateway_id: &str, owner: &str) {
        self.world().transit_gateways.insert(
            transit_gateway_id.to_string(),
            FakeTransitGateway {
                owner: owner.to_string(),
                auto_accept: true,
            },
        );
    }

    pub fn require_acceptance(&self, transit_gateway_id: &str) {
        if let Some(tgw) = self.world().transit_gateways.get_mut(transit_gateway_id) {
            tgw.auto_accept = false;
        }
    }

    /// New attachments never leave `status`
    pub fn stick_attachments_in(&self, status: AttachmentStatus) {
        self.world().stuck_attachments = Some(status);
    }

    /// The next `count` tag writes fail
    pub fn fail_tag_writes(&self, count: u32) {
        self.world().failing_tag_writes = count;
    }

    pub fn rename_template(&self, id: u64, name: &str) {
        if let Some(template) = self.world().templates.iter_mut().find(|t| t.id == id) {
            template.name = name.to_string();
        }
    }

    pub fn seed_attachment(&self, transit_gateway_id: &str, _network_id: &str, subnet_ids: &[&str]) -> String {
        let mut world = self.world();
        let id = world.next_id("tgw-attach");
        world.attachments.insert(
            id.clone(),
            FakeAttachment {
                transit_gateway_id: transit_gateway_id.to_string(),
                subnet_ids: subnet_ids.iter().map(|s| s.to_string()).collect(),
                status: AttachmentStatus::Available,
            },
        );
        id
    }

    pub fn attachment_subnets(&self, attachment_id: &str) -> Vec<String> {
        self.world()
            .attachments
            .get(attachment_id)
            .map(|a| a.subnet_ids.clone())
            .unwrap_or_default()
    }

    pub fn attachment_status(&self, attachment_id: &str) -> Option<AttachmentStatus> {
        self.world()
            .attachments
            .get(attachment_id)
            .map(|a| a.status.clone())
    }

    pub fn attachment_ids(&self) -> Vec<String> {
        self.world().attachments.keys().cloned().collect()
    }

    // Shares

    pub fn seed_share(&self, owner: &str, name: &str, resource_arns: &[String], principals: &[&str]) -> String {
        let mut world = self.world();
        let id = world.next_id(name);
        let arn = resource_share_arn(&Region::new("us-east-1"), owner, &id);
        world.shares.insert(
            arn.clone(),
            FakeShare {
                owner: owner.to_string(),
                resources: resource_arns.to_vec(),
                principals: principals.iter().map(|p| p.to_string()).collect(),
                accepted: principals.iter().map(|p| p.to_string()).collect(),
            },
        );
        arn
    }

    pub fn share_resource_arns(&self, share_arn: &str) -> Vec<String> {
        self.world()
            .shares
            .get(share_arn)
            .map(|s| s.resources.clone())
            .unwrap_or_default()
    }

    pub fn share_principals(&self, share_arn: &str) -> Vec<String> {
        self.world()
            .shares
            .get(share_arn)
            .map(|s| s.principals.clone())
            .unwrap_or_default()
    }

    pub fn share_status_for(&self, share_arn: &str, account_id: &str) -> Option<ShareStatus> {
        received_status(&self.world(), share_arn, account_id)
    }

    // Resolver

    pub fn seed_resolver_rule(&self, owner: &str, rule_id: &str) {
        self.world()
            .resolver_rules
            .insert(rule_id.to_string(), owner.to_string());
    }

    /// An association made outside of reconciliation
    pub fn seed_association(&self, account_id: &str, rule_id: &str, network_id: &str) -> String {
        let mut world = self.world();
        let id = world.next_id("rslvr-rrassoc");
        world.associations.insert(
            id.clone(),
            FakeAssociation {
                account: account_id.to_string(),
                rule_id: rule_id.to_string(),
                network_id: network_id.to_string(),
            },
        );
        id
    }

    /// Make an association vanish behind reconciliation's back
    pub fn drop_association(&self, association_id: &str) {
        self.world().associations.remove(association_id);
    }
}

fn received_status(world: &World, share_arn: &str, account_id: &str) -> Option<ShareStatus> {
    let share = world.shares.get(share_arn)?;
    if !share.principals.iter().any(|p| p == account_id) {
        return None;
    }
    if share.accepted.contains(account_id) {
        Some(ShareStatus::Active)
    } else {
        Some(ShareStatus::Pending)
    }
}

/// One account's view of the fake cloud
pub struct FakeAccount {
    cloud: FakeCloud,
    account_id: String,
    region: Region,
}

impl FakeAccount {
    /// Log a mutating call and lock the world for it
    fn call(&self, call: String) -> MutexGuard<'_, World> {
        let mut world = self.cloud.world();
        world.calls.push((self.account_id.clone(), call));
        world
    }
}

fn not_found(what: &str, id: &str) -> ProviderError {
    ProviderError::not_found(format!("{} not found", what)).for_resource(id)
}

fn observed(route: &Route) -> ObservedRoute {
    let mut observed = ObservedRoute::default();
    match &route.destination {
        RouteDestination::Cidr(cidr) => observed.destination_cidr_block = Some(cidr.clone()),
        RouteDestination::PrefixList(pl) => observed.destination_prefix_list_id = Some(pl.clone()),
    }
    match &route.owner {
        RouteOwner::PeeringConnection(id) => observed.vpc_peering_connection_id = Some(id.clone()),
        RouteOwner::TransitGateway(id) => observed.transit_gateway_id = Some(id.clone()),
        RouteOwner::NatGateway(id) => observed.nat_gateway_id = Some(id.clone()),
        RouteOwner::InternetGateway(id) | RouteOwner::VpcEndpoint(id) => {
            observed.gateway_id = Some(id.clone())
        }
    }
    observed
}

#[async_trait]
impl NetworkProvider for FakeAccount {
    async fn describe_route_table(&self, route_table_id: &str) -> ProviderResult<Option<ObservedRouteTable>> {
        Ok(self.cloud.world().route_tables.get(route_table_id).map(|routes| {
            ObservedRouteTable {
                id: route_table_id.to_string(),
                routes: routes.values().map(observed).collect(),
            }
        }))
    }

    async fn create_route(&self, route_table_id: &str, route: &Route) -> ProviderResult<()> {
        let mut world = self.call(format!("create_route {} {}", route_table_id, route.destination));
        let routes = world
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("route table", route_table_id))?;
        let key = route.destination.to_string();
        if routes.contains_key(&key) {
            return Err(ProviderError::already_exists("route already exists").for_resource(key));
        }
        routes.insert(key, route.clone());
        Ok(())
    }

    async fn replace_route(&self, route_table_id: &str, route: &Route) -> ProviderResult<()> {
        let mut world = self.call(format!("replace_route {} {}", route_table_id, route.destination));
        let routes = world
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("route table", route_table_id))?;
        let key = route.destination.to_string();
        match routes.get_mut(&key) {
            Some(existing) => {
                *existing = route.clone();
                Ok(())
            }
            None => Err(not_found("route", &key)),
        }
    }

    async fn delete_route(&self, route_table_id: &str, destination: &RouteDestination) -> ProviderResult<()> {
        let mut world = self.call(format!("delete_route {} {}", route_table_id, destination));
        world
            .route_tables
            .get_mut(route_table_id)
            .and_then(|routes| routes.remove(destination.as_str()))
            .map(|_| ())
            .ok_or_else(|| not_found("route", destination.as_str()))
    }

    async fn create_peering_connection(&self, request: &PeeringRequest) -> ProviderResult<String> {
        let mut world = self.call(format!(
            "create_peering_connection {} {}",
            request.requester_network_id, request.accepter_network_id
        ));
        let id = world.next_id("pcx");
        world.peerings.insert(
            id.clone(),
            FakePeering {
                accepter_account: request.accepter_account_id.clone(),
                status: PeeringStatus::PendingAcceptance,
            },
        );
        Ok(id)
    }

    async fn accept_peering_connection(&self, connection_id: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("accept_peering_connection {}", connection_id));
        let peering = world
            .peerings
            .get_mut(connection_id)
            .ok_or_else(|| not_found("peering connection", connection_id))?;
        if peering.accepter_account != self.account_id {
            return Err(ProviderError::new("only the accepter account may accept").for_resource(connection_id));
        }
        peering.status = PeeringStatus::Active;
        Ok(())
    }

    async fn delete_peering_connection(&self, connection_id: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("delete_peering_connection {}", connection_id));
        let peering = world
            .peerings
            .get_mut(connection_id)
            .ok_or_else(|| not_found("peering connection", connection_id))?;
        peering.status = PeeringStatus::Deleted;
        Ok(())
    }

    async fn peering_connection_status(&self, connection_id: &str) -> ProviderResult<Option<PeeringStatus>> {
        Ok(self
            .cloud
            .world()
            .peerings
            .get(connection_id)
            .map(|p| p.status.clone()))
    }

    async fn create_transit_gateway_attachment(
        &self,
        transit_gateway_id: &str,
        network_id: &str,
        subnet_ids: &[String],
    ) -> ProviderResult<String> {
        let mut world = self.call(format!(
            "create_transit_gateway_attachment {} {}",
            transit_gateway_id, network_id
        ));
        let auto_accept = world
            .transit_gateways
            .get(transit_gateway_id)
            .map(|tgw| tgw.auto_accept)
            .ok_or_else(|| not_found("transit gateway", transit_gateway_id))?;
        let status = match &world.stuck_attachments {
            Some(status) => status.clone(),
            None if auto_accept => AttachmentStatus::Available,
            None => AttachmentStatus::PendingAcceptance,
        };
        let id = world.next_id("tgw-attach");
        world.attachments.insert(
            id.clone(),
            FakeAttachment {
                transit_gateway_id: transit_gateway_id.to_string(),
                subnet_ids: subnet_ids.to_vec(),
                status,
            },
        );
        Ok(id)
    }

    async fn modify_transit_gateway_attachment(
        &self,
        attachment_id: &str,
        add_subnet_ids: &[String],
        remove_subnet_ids: &[String],
    ) -> ProviderResult<()> {
        let mut world = self.call(format!(
            "modify_transit_gateway_attachment {} add=[{}] remove=[{}]",
            attachment_id,
            add_subnet_ids.join(","),
            remove_subnet_ids.join(",")
        ));
        let attachment = world
            .attachments
            .get_mut(attachment_id)
            .ok_or_else(|| not_found("transit gateway attachment", attachment_id))?;
        attachment.subnet_ids.retain(|s| !remove_subnet_ids.contains(s));
        attachment.subnet_ids.extend(add_subnet_ids.iter().cloned());
        Ok(())
    }

    async fn delete_transit_gateway_attachment(&self, attachment_id: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("delete_transit_gateway_attachment {}", attachment_id));
        world
            .attachments
            .remove(attachment_id)
            .map(|_| ())
            .ok_or_else(|| not_found("transit gateway attachment", attachment_id))
    }

    async fn accept_transit_gateway_attachment(&self, attachment_id: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("accept_transit_gateway_attachment {}", attachment_id));
        let tgw_id = world
            .attachments
            .get(attachment_id)
            .map(|a| a.transit_gateway_id.clone())
            .ok_or_else(|| not_found("transit gateway attachment", attachment_id))?;
        let owner = world
            .transit_gateways
            .get(&tgw_id)
            .map(|tgw| tgw.owner.clone())
            .unwrap_or_default();
        if owner != self.account_id {
            return Err(ProviderError::new("only the transit gateway owner may accept").for_resource(attachment_id));
        }
        if let Some(attachment) = world.attachments.get_mut(attachment_id) {
            attachment.status = AttachmentStatus::Available;
        }
        Ok(())
    }

    async fn transit_gateway_attachment_status(&self, attachment_id: &str) -> ProviderResult<Option<AttachmentStatus>> {
        Ok(self
            .cloud
            .world()
            .attachments
            .get(attachment_id)
            .map(|a| a.status.clone()))
    }

    async fn transit_gateway_status(&self, transit_gateway_id: &str) -> ProviderResult<Option<TransitGatewayStatus>> {
        Ok(self
            .cloud
            .world()
            .transit_gateways
            .get(transit_gateway_id)
            .map(|_| TransitGatewayStatus::Available))
    }

    async fn tag_resource(&self, resource_id: &str, tags: &BTreeMap<String, String>) -> ProviderResult<()> {
        let mut world = self.call(format!("tag_resource {}", resource_id));
        if world.failing_tag_writes > 0 {
            world.failing_tag_writes -= 1;
            return Err(ProviderError::new("tagging throttled").for_resource(resource_id));
        }
        world
            .tags
            .entry(resource_id.to_string())
            .or_default()
            .extend(tags.clone());
        Ok(())
    }

    async fn subnet_cidr(&self, subnet_id: &str) -> ProviderResult<String> {
        self.cloud
            .world()
            .subnet_cidrs
            .get(subnet_id)
            .cloned()
            .ok_or_else(|| not_found("subnet", subnet_id))
    }
}

#[async_trait]
impl ShareProvider for FakeAccount {
    async fn owned_share_for_resource(&self, resource_arn: &str) -> ProviderResult<Option<String>> {
        Ok(self
            .cloud
            .world()
            .shares
            .iter()
            .find(|(_, s)| s.owner == self.account_id && s.resources.iter().any(|r| r == resource_arn))
            .map(|(arn, _)| arn.clone()))
    }

    async fn create_share(&self, name: &str, resource_arns: &[String]) -> ProviderResult<String> {
        let mut world = self.call(format!("create_share {}", name));
        let id = world.next_id("share");
        let arn = resource_share_arn(&self.region, &self.account_id, &id);
        world.shares.insert(
            arn.clone(),
            FakeShare {
                owner: self.account_id.clone(),
                resources: resource_arns.to_vec(),
                principals: Vec::new(),
                accepted: BTreeSet::new(),
            },
        );
        Ok(arn)
    }

    async fn share_resources(&self, share_arn: &str) -> ProviderResult<Vec<String>> {
        self.cloud
            .world()
            .shares
            .get(share_arn)
            .map(|s| s.resources.clone())
            .ok_or_else(|| not_found("resource share", share_arn))
    }

    async fn associate_resources(&self, share_arn: &str, resource_arns: &[String]) -> ProviderResult<()> {
        let mut world = self.call(format!("associate_resources {}", share_arn));
        let share = world
            .shares
            .get_mut(share_arn)
            .ok_or_else(|| not_found("resource share", share_arn))?;
        share.resources.extend(resource_arns.iter().cloned());
        Ok(())
    }

    async fn share_principals(&self, share_arn: &str) -> ProviderResult<Vec<String>> {
        self.cloud
            .world()
            .shares
            .get(share_arn)
            .map(|s| s.principals.clone())
            .ok_or_else(|| not_found("resource share", share_arn))
    }

    async fn associate_principal(&self, share_arn: &str, principal: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("associate_principal {} {}", share_arn, principal));
        let organization = world.organization_sharing;
        let share = world
            .shares
            .get_mut(share_arn)
            .ok_or_else(|| not_found("resource share", share_arn))?;
        share.principals.push(principal.to_string());
        if organization {
            share.accepted.insert(principal.to_string());
        } else {
            let invitation = world.next_id("invitation");
            world
                .invitations
                .insert(invitation, (share_arn.to_string(), principal.to_string()));
        }
        Ok(())
    }

    async fn disassociate_principal(&self, share_arn: &str, principal: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("disassociate_principal {} {}", share_arn, principal));
        let share = world
            .shares
            .get_mut(share_arn)
            .ok_or_else(|| not_found("resource share", share_arn))?;
        share.principals.retain(|p| p != principal);
        share.accepted.remove(principal);
        Ok(())
    }

    async fn received_share_status(&self, share_arn: &str) -> ProviderResult<Option<ShareStatus>> {
        Ok(received_status(&self.cloud.world(), share_arn, &self.account_id))
    }

    async fn pending_invitation(&self, share_arn: &str) -> ProviderResult<Option<String>> {
        Ok(self
            .cloud
            .world()
            .invitations
            .iter()
            .find(|(_, (arn, account))| arn == share_arn && *account == self.account_id)
            .map(|(id, _)| id.clone()))
    }

    async fn accept_invitation(&self, invitation_arn: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("accept_invitation {}", invitation_arn));
        let (share_arn, account) = world
            .invitations
            .remove(invitation_arn)
            .ok_or_else(|| not_found("invitation", invitation_arn))?;
        if let Some(share) = world.shares.get_mut(&share_arn) {
            share.accepted.insert(account);
        }
        Ok(())
    }
}

#[async_trait]
impl ResolverProvider for FakeAccount {
    async fn resolver_rule_status(&self, rule_id: &str) -> ProviderResult<Option<ResolverRuleStatus>> {
        Ok(self
            .cloud
            .world()
            .resolver_rules
            .get(rule_id)
            .map(|_| ResolverRuleStatus::Complete))
    }

    async fn associate_resolver_rule(&self, rule_id: &str, network_id: &str) -> ProviderResult<String> {
        let mut world = self.call(format!("associate_resolver_rule {} {}", rule_id, network_id));
        if world
            .associations
            .values()
            .any(|a| a.rule_id == rule_id && a.network_id == network_id)
        {
            return Err(ProviderError::already_exists("rule is already associated with the network"));
        }
        let id = world.next_id("rslvr-rrassoc");
        world.associations.insert(
            id.clone(),
            FakeAssociation {
                account: self.account_id.clone(),
                rule_id: rule_id.to_string(),
                network_id: network_id.to_string(),
            },
        );
        Ok(id)
    }

    async fn disassociate_resolver_rule(&self, rule_id: &str, network_id: &str) -> ProviderResult<()> {
        let mut world = self.call(format!("disassociate_resolver_rule {} {}", rule_id, network_id));
        let id = world
            .associations
            .iter()
            .find(|(_, a)| a.rule_id == rule_id && a.network_id == network_id)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| not_found("resolver rule association", rule_id))?;
        world.associations.remove(&id);
        Ok(())
    }

    async fn resolver_rule_association_status(
        &self,
        association_id: &str,
    ) -> ProviderResult<Option<ResolverAssociationStatus>> {
        Ok(self
            .cloud
            .world()
            .associations
            .get(association_id)
            .map(|_| ResolverAssociationStatus::Complete))
    }

    async fn resolver_rule_association_count(&self, rule_id: &str) -> ProviderResult<usize> {
        Ok(self
            .cloud
            .world()
            .associations
            .values()
            .filter(|a| a.rule_id == rule_id && a.account == self.account_id)
            .count())
    }
}

/// Hands out `FakeAccount`s, optionally refusing some accounts
pub struct FakeAccess {
    cloud: FakeCloud,
    denied: BTreeSet<String>,
}

impl FakeAccess {
    pub fn new(cloud: &FakeCloud) -> Self {
        Self {
            cloud: cloud.clone(),
            denied: BTreeSet::new(),
        }
    }

    pub fn deny(mut self, account_id: &str) -> Self {
        self.denied.insert(account_id.to_string());
        self
    }
}

#[async_trait]
impl AccountAccess for FakeAccess {
    async fn resolve(&self, account_id: &str, region: &Region) -> ProviderResult<AccountClients> {
        if self.denied.contains(account_id) {
            return Err(ProviderError::no_credentials(account_id));
        }
        let account = Arc::new(self.cloud.account(account_id, region.as_str()));
        Ok(AccountClients {
            network: account.clone(),
            share: account.clone(),
            resolver: account,
        })
    }
}

/// `ModelsManager` over the fake cloud's persisted networks and catalog
pub struct MemoryStore {
    cloud: FakeCloud,
}

impl MemoryStore {
    pub fn network(&self, network_id: &str) -> Network {
        self.cloud.world().networks[network_id].clone()
    }

    pub fn rule_set(&self, id: u64) -> ManagedResolverRuleSet {
        self.cloud
            .world()
            .rule_sets
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .unwrap()
    }
}

#[async_trait]
impl ModelsManager for MemoryStore {
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
            .cloud
            .world()
            .networks
            .get(network_id)
            .filter(|n| &n.region == region)
            .cloned()
            .ok_or_else(|| StoreError::NetworkNotFound {
                region: region.clone(),
                network_id: network_id.to_string(),
            })?;
        let writer = Arc::new(MemoryWriter {
            cloud: self.cloud.clone(),
            network_id: network_id.to_string(),
        });
        Ok(OperableNetwork::new(network, writer))
    }

    async fn transit_gateway_templates(&self) -> StoreResult<Vec<TransitGatewayAttachmentTemplate>> {
        Ok(self.cloud.world().templates.clone())
    }

    async fn resolver_rule_sets(&self) -> StoreResult<Vec<ManagedResolverRuleSet>> {
        Ok(self.cloud.world().rule_sets.clone())
    }

    async fn transit_gateway_share(
        &self,
        region: &Region,
        transit_gateway_id: &str,
    ) -> StoreResult<Option<TransitGatewayShare>> {
        Ok(self
            .cloud
            .world()
            .transit_gateway_shares
            .iter()
            .find(|s| &s.region == region && s.transit_gateway_id == transit_gateway_id)
            .cloned())
    }

    async fn record_resource_share(&self, rule_set_id: u64, share_id: &str) -> StoreResult<()> {
        let mut world = self.cloud.world();
        let set = world
            .rule_sets
            .iter_mut()
            .find(|s| s.id == rule_set_id)
            .ok_or(StoreError::RuleSetNotFound(rule_set_id))?;
        set.resource_share_id = Some(share_id.to_string());
        Ok(())
    }
}

struct MemoryWriter {
    cloud: FakeCloud,
    network_id: String,
}

#[async_trait]
impl StateWriter for MemoryWriter {
    async fn apply(&self, mutation: &StateMutation) -> StoreResult<()> {
        let mut world = self.cloud.world();
        let network = world
            .networks
            .get_mut(&self.network_id)
            .ok_or_else(|| StoreError::Backend(format!("network {} vanished", self.network_id)))?;
        network.state.apply(mutation);
        Ok(())
    }
}

/// Locks held by this task, plus locks pretended to be held by others
#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<BTreeSet<LockTarget>>,
    elsewhere: Mutex<BTreeSet<LockTarget>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self, target: &LockTarget) -> bool {
        self.held.lock().unwrap().contains(target)
    }

    pub fn hold_elsewhere(&self, target: LockTarget) {
        self.elsewhere.lock().unwrap().insert(target);
    }
}

#[async_trait]
impl LockSet for MemoryLocks {
    async fn has_lock(&self, target: &LockTarget) -> bool {
        self.held(target)
    }

    async fn acquire_additional(&self, target: &LockTarget) -> StoreResult<()> {
        if self.elsewhere.lock().unwrap().contains(target) {
            return Err(StoreError::LockHeld(target.key()));
        }
        self.held.lock().unwrap().insert(target.clone());
        Ok(())
    }

    async fn release(&self, target: &LockTarget) -> StoreResult<()> {
        if self.held.lock().unwrap().remove(target) {
            Ok(())
        } else {
            Err(StoreError::LockNotHeld(target.key()))
        }
    }

    async fn release_all(&self) -> StoreResult<()> {
        self.held.lock().unwrap().clear();
        Ok(())
    }
}

/// Builds networks with predictable IDs: `subnet-{network}-{group}-{az}` and
/// `rtb-{network}-{group}-{az}`, where `az` is the zone's last letter
fn add_table(state: &mut NetworkState, rt_id: &str, subnet_type: SubnetType) {
    state.route_tables.insert(
        rt_id.to_string(),
        RouteTable::new(rt_id, Some(RouteTableAssociation::Subnet(subnet_type))),
    );
}

pub struct NetworkBuilder {
    account_id: String,
    id: String,
    name: String,
    network_type: NetworkType,
    azs: Vec<String>,
    private: bool,
    public: bool,
    groups: Vec<(String, SubnetType)>,
}

impl NetworkBuilder {
    pub fn new(account_id: &str, id: &str, name: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            network_type: NetworkType::default(),
            azs: Vec::new(),
            private: false,
            public: false,
            groups: Vec::new(),
        }
    }

    pub fn network_type(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }

    pub fn azs(mut self, azs: &[&str]) -> Self {
        self.azs = azs.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn private_subnets(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn public_subnets(mut self) -> Self {
        self.public = true;
        self
    }

    /// A named subnet group with its own route table per AZ
    pub fn group(mut self, name: &str, subnet_type: SubnetType) -> Self {
        self.groups.push((name.to_string(), subnet_type));
        self
    }

    pub fn build(self) -> Network {
        let id = self.id.as_str();
        let mut state = NetworkState {
            network_type: self.network_type,
            ..Default::default()
        };
        let subnet = |group: &str, suffix: &str, custom: Option<String>| Subnet {
            id: format!("subnet-{}-{}-{}", id, group, suffix),
            group_name: group.to_string(),
            custom_route_table_id: custom,
        };

        if self.public && !self.network_type.has_firewall() {
            let rt_id = format!("rtb-{}-public", id);
            add_table(&mut state, &rt_id, SubnetType::Public);
            state.public_route_table_id = Some(rt_id);
        }

        for az_name in &self.azs {
            let suffix = az_name
                .chars()
                .last()
                .map(String::from)
                .unwrap_or_default();
            let mut az = AvailabilityZone::default();

            if self.private {
                let rt_id = format!("rtb-{}-private-{}", id, suffix);
                add_table(&mut state, &rt_id, SubnetType::Private);
                az.private_route_table_id = Some(rt_id);
                az.subnets
                    .entry(SubnetType::Private)
                    .or_default()
                    .push(subnet("private", &suffix, None));
            }
            if self.public {
                if self.network_type.has_firewall() {
                    let rt_id = format!("rtb-{}-public-{}", id, suffix);
                    add_table(&mut state, &rt_id, SubnetType::Public);
                    az.public_route_table_id = Some(rt_id);
                }
                az.subnets
                    .entry(SubnetType::Public)
                    .or_default()
                    .push(subnet("public", &suffix, None));
            }
            for (group, subnet_type) in &self.groups {
                let rt_id = format!("rtb-{}-{}-{}", id, group, suffix);
                add_table(&mut state, &rt_id, *subnet_type);
                az.subnets
                    .entry(*subnet_type)
                    .or_default()
                    .push(subnet(group, &suffix, Some(rt_id)));
            }
            state.availability_zones.insert(az_name.clone(), az);
        }

        Network {
            account_id: self.account_id,
            id: self.id.clone(),
            name: self.name,
            region: Region::new("us-east-1"),
            state,
        }
    }
}
