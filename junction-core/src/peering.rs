//! Peering connections between two networks
//!
//! Connections are keyed by the unordered pair of endpoints, so the task of
//! either network finds the same record. A connection is never edited: a
//! reversed direction or a removed relationship deletes it, and a new one is
//! created when needed.

use std::collections::{BTreeMap, BTreeSet};

use crate::context::ReconcileContext;
use crate::error::{ReconcileError, ValidationError};
use crate::network::{
    Network, NetworkEndpoint, NetworkState, PeeringConnection, PeeringKey, Region, RouteDestination,
    RouteOwner, StateMutation,
};
use crate::provider::{AccountAccess, AccountClients, NetworkProvider, PeeringRequest, PeeringStatus};
use crate::routes::{converge_routes, remove_owner_routes, routable_tables};
use crate::store::{LockSet, LockTarget, ModelsManager, OperableNetwork, StoreError, ensure_lock};
use crate::task::ReconcileSummary;
use crate::template::{NetworkingConfig, PeeringConnectionTemplate, SubnetSelection};
use crate::wait::{WaitTarget, await_deleted, await_status};

/// Reject named subnet groups whose subnet type may only be selected as a whole
pub fn validate_selection(network: &Network, selection: &SubnetSelection) -> Result<(), ValidationError> {
    for group in selection.named_groups() {
        let disallowed = network
            .state
            .subnets()
            .find(|(_, subnet_type, subnet)| {
                &subnet.group_name == group && !subnet_type.allows_group_selection()
            });
        if let Some((_, subnet_type, _)) = disallowed {
            return Err(ValidationError::SubnetGroupNotAllowed {
                network_id: network.id.clone(),
                group: group.clone(),
                subnet_type,
            });
        }
    }
    Ok(())
}

/// IDs of the subnets a selection picks out
pub fn selected_subnet_ids(state: &NetworkState, selection: &SubnetSelection) -> BTreeSet<String> {
    state
        .subnets()
        .filter(|(_, subnet_type, subnet)| selection.selects(*subnet_type, subnet))
        .map(|(_, _, subnet)| subnet.id.clone())
        .collect()
}

pub fn connection_tags(requester_name: &str, accepter_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("Name".to_string(), format!("{}-to-{}", requester_name, accepter_name)),
        ("Automated".to_string(), "true".to_string()),
    ])
}

/// The other network of a configured peering, loaded and locked
struct PeerNetwork {
    template: PeeringConnectionTemplate,
    network: OperableNetwork,
    clients: AccountClients,
}

/// Peers loaded and validated before anything is changed
pub struct PeeringPlan {
    peers: Vec<PeerNetwork>,
}

impl PeeringPlan {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// A live connection, ready for route application
pub struct PeeringLink {
    connection_id: String,
    peer: PeerNetwork,
}

impl PeeringLink {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

pub struct PeeringReconciler<'a> {
    ctx: &'a ReconcileContext,
    catalog: &'a dyn ModelsManager,
    access: &'a dyn AccountAccess,
    locks: &'a dyn LockSet,
}

impl<'a> PeeringReconciler<'a> {
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

    async fn load_network(&self, region: &Region, network_id: &str) -> Result<OperableNetwork, ReconcileError> {
        ensure_lock(self.locks, &LockTarget::Network(network_id.to_string())).await?;
        Ok(self
            .catalog
            .operable_network(self.locks, region, network_id)
            .await?)
    }

    /// Load every configured peer and validate both sides' subnet selections
    pub async fn prepare(
        &self,
        network: &OperableNetwork,
        config: &NetworkingConfig,
    ) -> Result<PeeringPlan, ReconcileError> {
        let mut seen = BTreeSet::new();
        for template in &config.peering_connections {
            validate_selection(network.network(), &template.connect)?;
            if template.other_network_id == network.id() {
                return Err(ReconcileError::inconsistent(format!(
                    "Network {} cannot peer with itself",
                    network.id()
                )));
            }
            let endpoint = NetworkEndpoint::new(&template.other_network_id, template.other_region.clone());
            if !seen.insert(endpoint) {
                return Err(ValidationError::DuplicatePeering {
                    network_id: template.other_network_id.clone(),
                }
                .into());
            }
        }

        let mut peers = Vec::new();
        for template in &config.peering_connections {
            let peer = self
                .load_network(&template.other_region, &template.other_network_id)
                .await?;
            validate_selection(peer.network(), &template.other_connect)?;
            let clients = self.access.resolve(peer.account_id(), peer.region()).await?;
            peers.push(PeerNetwork {
                template: template.clone(),
                network: peer,
                clients,
            });
        }
        Ok(PeeringPlan { peers })
    }

    /// Tear down unconfigured connections, then create or finish the configured ones
    pub async fn reconcile(
        &self,
        network: &mut OperableNetwork,
        plan: PeeringPlan,
        summary: &mut ReconcileSummary,
    ) -> Result<Vec<PeeringLink>, ReconcileError> {
        let local = self
            .access
            .resolve(network.account_id(), network.region())
            .await?;
        let local_endpoint = network.network().endpoint();
        let configured: BTreeSet<PeeringKey> = plan
            .peers
            .iter()
            .map(|p| PeeringKey::new(local_endpoint.clone(), p.network.network().endpoint()))
            .collect();

        let unconfigured: Vec<PeeringConnection> = network
            .state()
            .peering_connections
            .iter()
            .filter(|pc| !configured.contains(&pc.key()))
            .cloned()
            .collect();
        for connection in &unconfigured {
            let other = connection.other_side(&local_endpoint);
            let peer = match self.load_network(&other.region, &other.network_id).await {
                Ok(peer) => {
                    let clients = self.access.resolve(peer.account_id(), peer.region()).await?;
                    Some((peer, clients))
                }
                Err(ReconcileError::Store(StoreError::NetworkNotFound { .. })) => {
                    tracing::warn!(
                        peer = %other,
                        connection = %connection.connection_id,
                        "peer network no longer exists; cleaning up this side only"
                    );
                    None
                }
                Err(e) => return Err(e),
            };
            let mut peer = peer;
            self.teardown(
                network,
                &local,
                peer.as_mut().map(|(n, c)| (n, &*c)),
                connection,
                summary,
            )
            .await?;
        }

        let mut links = Vec::new();
        for mut peer in plan.peers {
            let connection_id = self
                .ensure_connection(network, &local, &mut peer, summary)
                .await?;
            links.push(PeeringLink { connection_id, peer });
        }
        Ok(links)
    }

    /// Remove the connection's routes on both sides, delete it and forget it
    async fn teardown(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        peer: Option<(&mut OperableNetwork, &AccountClients)>,
        connection: &PeeringConnection,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let connection_id = connection.connection_id.as_str();
        let owner = RouteOwner::PeeringConnection(connection_id.to_string());
        let key = connection.key();

        summary.routes +=
            remove_owner_routes(self.ctx, network, local.network.as_ref(), &owner, false).await?;
        let mut peer = peer;
        if let Some((peer_network, clients)) = peer.as_mut() {
            summary.routes +=
                remove_owner_routes(self.ctx, peer_network, clients.network.as_ref(), &owner, false)
                    .await?;
        }

        match local.network.delete_peering_connection(connection_id).await {
            Ok(()) => {
                tracing::info!(connection = connection_id, "deleted peering connection");
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(connection = connection_id, "peering connection already gone");
            }
            Err(e) => return Err(e.into()),
        }
        let resource = format!("peering connection {}", connection_id);
        let target = WaitTarget::new(&resource, "deleted", self.ctx.wait().peering_timeout());
        await_deleted(
            self.ctx,
            &target,
            &[
                PeeringStatus::Deleted,
                PeeringStatus::Rejected,
                PeeringStatus::Failed,
                PeeringStatus::Expired,
            ],
            &[],
            || local.network.peering_connection_status(connection_id),
        )
        .await?;

        if network.state().peering_connection(&key).is_some() {
            network
                .commit(StateMutation::RemovePeeringConnection(key.clone()))
                .await?;
        }
        if let Some((peer_network, _)) = peer
            && peer_network.state().peering_connection(&key).is_some()
        {
            peer_network
                .commit(StateMutation::RemovePeeringConnection(key))
                .await?;
        }
        summary.peerings_deleted += 1;
        Ok(())
    }

    async fn ensure_connection(
        &self,
        network: &mut OperableNetwork,
        local: &AccountClients,
        peer: &mut PeerNetwork,
        summary: &mut ReconcileSummary,
    ) -> Result<String, ReconcileError> {
        let PeerNetwork {
            template,
            network: peer_network,
            clients: peer_clients,
        } = peer;
        let local_endpoint = network.network().endpoint();
        let peer_endpoint = peer_network.network().endpoint();
        let key = PeeringKey::new(local_endpoint.clone(), peer_endpoint.clone());

        let (requester, accepter) = if template.is_requester {
            (local_endpoint, peer_endpoint)
        } else {
            (peer_endpoint, local_endpoint)
        };

        let existing = network
            .state()
            .peering_connection(&key)
            .or_else(|| peer_network.state().peering_connection(&key))
            .cloned();
        let existing = match existing {
            Some(connection) if connection.requester != requester => {
                tracing::info!(
                    connection = %connection.connection_id,
                    requester = %requester,
                    "peering direction reversed; replacing connection"
                );
                self.teardown(
                    network,
                    local,
                    Some((&mut *peer_network, &*peer_clients)),
                    &connection,
                    summary,
                )
                .await?;
                None
            }
            other => other,
        };

        let (requester_clients, accepter_clients) = if template.is_requester {
            (local, &*peer_clients)
        } else {
            (&*peer_clients, local)
        };
        let (requester_name, accepter_name, accepter_account) = if template.is_requester {
            (
                network.network().name.clone(),
                peer_network.network().name.clone(),
                peer_network.account_id().to_string(),
            )
        } else {
            (
                peer_network.network().name.clone(),
                network.network().name.clone(),
                network.account_id().to_string(),
            )
        };

        let mut connection = match existing {
            Some(connection) => connection,
            None => {
                let request = PeeringRequest {
                    requester_network_id: requester.network_id.clone(),
                    accepter_network_id: accepter.network_id.clone(),
                    accepter_account_id: accepter_account.clone(),
                    accepter_region: accepter.region.clone(),
                };
                let connection_id = requester_clients
                    .network
                    .create_peering_connection(&request)
                    .await?;
                tracing::info!(
                    connection = %connection_id,
                    requester = %requester,
                    accepter = %accepter,
                    "created peering connection"
                );
                summary.peerings_created += 1;
                PeeringConnection {
                    requester,
                    accepter,
                    connection_id,
                    is_accepted: false,
                }
            }
        };
        record_on_both(network, peer_network, &connection).await?;
        if connection.is_accepted {
            return Ok(connection.connection_id);
        }

        let connection_id = connection.connection_id.clone();
        let status = wait_for_peering(
            self.ctx,
            requester_clients.network.as_ref(),
            &connection_id,
            "pending-acceptance",
            &[PeeringStatus::PendingAcceptance, PeeringStatus::Active],
            &[PeeringStatus::InitiatingRequest, PeeringStatus::Provisioning],
        )
        .await?;
        if status == PeeringStatus::PendingAcceptance {
            accepter_clients
                .network
                .accept_peering_connection(&connection_id)
                .await?;
            tracing::info!(connection = %connection_id, "accepted peering connection");
            wait_for_peering(
                self.ctx,
                requester_clients.network.as_ref(),
                &connection_id,
                "active",
                &[PeeringStatus::Active],
                &[PeeringStatus::PendingAcceptance, PeeringStatus::Provisioning],
            )
            .await?;
        }

        connection.is_accepted = true;
        record_on_both(network, peer_network, &connection).await?;

        let tags = connection_tags(&requester_name, &accepter_name);
        requester_clients
            .network
            .tag_resource(&connection_id, &tags)
            .await?;
        if network.account_id() != peer_network.account_id() {
            accepter_clients
                .network
                .tag_resource(&connection_id, &tags)
                .await?;
        }
        Ok(connection_id)
    }

    /// Converge each link's routes in both networks
    pub async fn apply_routes(
        &self,
        network: &mut OperableNetwork,
        links: &mut [PeeringLink],
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReconcileError> {
        let local = self
            .access
            .resolve(network.account_id(), network.region())
            .await?;
        for link in links.iter_mut() {
            let owner = RouteOwner::PeeringConnection(link.connection_id.clone());
            let PeerNetwork {
                template,
                network: peer_network,
                clients: peer_clients,
            } = &mut link.peer;

            let local_cidrs =
                selected_cidrs(network.state(), &template.connect, local.network.as_ref()).await?;
            let peer_cidrs = selected_cidrs(
                peer_network.state(),
                &template.other_connect,
                peer_clients.network.as_ref(),
            )
            .await?;

            summary.routes += converge_side(
                self.ctx,
                network,
                local.network.as_ref(),
                &template.connect,
                &owner,
                &peer_cidrs,
            )
            .await?;
            summary.routes += converge_side(
                self.ctx,
                peer_network,
                peer_clients.network.as_ref(),
                &template.other_connect,
                &owner,
                &local_cidrs,
            )
            .await?;
        }
        Ok(())
    }
}

async fn record_on_both(
    network: &mut OperableNetwork,
    peer: &mut OperableNetwork,
    connection: &PeeringConnection,
) -> Result<(), ReconcileError> {
    let key = connection.key();
    for side in [network, peer] {
        if side.state().peering_connection(&key) != Some(connection) {
            side.commit(StateMutation::PutPeeringConnection(connection.clone()))
                .await?;
        }
    }
    Ok(())
}

async fn selected_cidrs(
    state: &NetworkState,
    selection: &SubnetSelection,
    provider: &dyn NetworkProvider,
) -> Result<BTreeSet<RouteDestination>, ReconcileError> {
    let mut cidrs = BTreeSet::new();
    for subnet_id in selected_subnet_ids(state, selection) {
        let cidr = provider.subnet_cidr(&subnet_id).await?;
        cidrs.insert(RouteDestination::parse(cidr));
    }
    Ok(cidrs)
}

/// Tables serving a selected subnet get the peer's CIDRs; every other table
/// loses this connection's routes
async fn converge_side(
    ctx: &ReconcileContext,
    network: &mut OperableNetwork,
    provider: &dyn NetworkProvider,
    selection: &SubnetSelection,
    owner: &RouteOwner,
    peer_cidrs: &BTreeSet<RouteDestination>,
) -> Result<crate::differ::RoutePlanSummary, ReconcileError> {
    let selected = selected_subnet_ids(network.state(), selection);
    let empty = BTreeSet::new();
    let mut summary = crate::differ::RoutePlanSummary::default();
    for table in routable_tables(network.state())? {
        let desired = if table.subnet_ids.iter().any(|id| selected.contains(id)) {
            peer_cidrs
        } else {
            &empty
        };
        summary += converge_routes(ctx, network, provider, &table.route_table_id, desired, owner).await?;
    }
    Ok(summary)
}

async fn wait_for_peering(
    ctx: &ReconcileContext,
    provider: &dyn NetworkProvider,
    connection_id: &str,
    expected: &str,
    terminal: &[PeeringStatus],
    transitional: &[PeeringStatus],
) -> Result<PeeringStatus, ReconcileError> {
    let resource = format!("peering connection {}", connection_id);
    let target = WaitTarget::new(&resource, expected, ctx.wait().peering_timeout());
    await_status(ctx, &target, terminal, transitional, || {
        provider.peering_connection_status(connection_id)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeAccess, FakeCloud, MemoryLocks, NetworkBuilder, test_context};
    use crate::network::SubnetType;

    const ACCOUNT: &str = "111111111111";
    const OTHER_ACCOUNT: &str = "222222222222";

    fn two_az_network(account: &str, id: &str, name: &str) -> Network {
        NetworkBuilder::new(account, id, name)
            .azs(&["us-east-1a", "us-east-1b"])
            .private_subnets()
            .build()
    }

    fn peering(is_requester: bool, other: &str) -> NetworkingConfig {
        NetworkingConfig {
            transit_gateway_templates: vec![],
            peering_connections: vec![PeeringConnectionTemplate {
                is_requester,
                other_network_id: other.to_string(),
                other_region: Region::new("us-east-1"),
                connect: SubnetSelection::AllPrivate,
                other_connect: SubnetSelection::AllPrivate,
            }],
        }
    }

    async fn run(
        cloud: &FakeCloud,
        network_id: &str,
        config: &NetworkingConfig,
    ) -> (Result<(), ReconcileError>, ReconcileSummary) {
        let (ctx, _) = test_context();
        let locks = MemoryLocks::new();
        let access = FakeAccess::new(cloud);
        let store = cloud.store();
        let reconciler = PeeringReconciler::new(&ctx, &store, &access, &locks);
        let mut summary = ReconcileSummary::default();
        let result = async {
            let mut network = cloud.open(&store, &locks, network_id).await;
            let plan = reconciler.prepare(&network, config).await?;
            let mut links = reconciler.reconcile(&mut network, plan, &mut summary).await?;
            reconciler
                .apply_routes(&mut network, &mut links, &mut summary)
                .await
        }
        .await;
        (result, summary)
    }

    fn pcx_routes(cloud: &FakeCloud, rt: &str) -> Vec<String> {
        cloud
            .routes(rt)
            .into_iter()
            .filter(|r| matches!(r.owner, RouteOwner::PeeringConnection(_)))
            .map(|r| r.destination.to_string())
            .collect()
    }

    #[test]
    fn test_named_private_group_is_rejected() {
        let network = NetworkBuilder::new(ACCOUNT, "vpc-a", "alpha")
            .azs(&["us-east-1a"])
            .private_subnets()
            .group("app", SubnetType::App)
            .build();

        validate_selection(&network, &SubnetSelection::Groups(vec!["app".to_string()])).unwrap();
        let err = validate_selection(
            &network,
            &SubnetSelection::Groups(vec!["private".to_string()]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::SubnetGroupNotAllowed {
                network_id: "vpc-a".to_string(),
                group: "private".to_string(),
                subnet_type: SubnetType::Private,
            }
        );
    }

    #[tokio::test]
    async fn test_validation_fails_before_any_call() {
        let cloud = FakeCloud::new();
        cloud.register(two_az_network(ACCOUNT, "vpc-a", "alpha"));
        cloud.register(two_az_network(ACCOUNT, "vpc-b", "bravo"));
        let mut config = peering(true, "vpc-b");
        config.peering_connections[0].other_connect =
            SubnetSelection::Groups(vec!["private".to_string()]);

        let (result, _) = run(&cloud, "vpc-a", &config).await;
        assert!(matches!(
            result,
            Err(ReconcileError::Validation(ValidationError::SubnetGroupNotAllowed { ref network_id, .. })) if network_id == "vpc-b"
        ));
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_basic_peering_same_account() {
        let cloud = FakeCloud::new();
        cloud.register(two_az_network(ACCOUNT, "vpc-a", "alpha"));
        cloud.register(two_az_network(ACCOUNT, "vpc-b", "bravo"));

        let (result, summary) = run(&cloud, "vpc-a", &peering(true, "vpc-b")).await;
        result.unwrap();

        assert_eq!(summary.peerings_created, 1);
        let creates: Vec<String> = cloud
            .mutations()
            .into_iter()
            .filter(|m| m.starts_with("create_peering_connection"))
            .collect();
        assert_eq!(creates.len(), 1);

        let store = cloud.store();
        let a = store.network("vpc-a");
        let b = store.network("vpc-b");
        assert_eq!(a.state.peering_connections.len(), 1);
        assert_eq!(a.state.peering_connections, b.state.peering_connections);
        let connection = &a.state.peering_connections[0];
        assert!(connection.is_accepted);
        assert_eq!(connection.requester.network_id, "vpc-a");

        let b_cidrs = cloud.subnet_cidrs("vpc-b");
        let a_cidrs = cloud.subnet_cidrs("vpc-a");
        for rt in ["rtb-vpc-a-private-a", "rtb-vpc-a-private-b"] {
            assert_eq!(pcx_routes(&cloud, rt), b_cidrs);
        }
        for rt in ["rtb-vpc-b-private-a", "rtb-vpc-b-private-b"] {
            assert_eq!(pcx_routes(&cloud, rt), a_cidrs);
        }
        for rt in [
            "rtb-vpc-a-private-a",
            "rtb-vpc-a-private-b",
            "rtb-vpc-b-private-a",
            "rtb-vpc-b-private-b",
        ] {
            assert!(cloud.routes(rt).iter().all(|r| r.owner
                == RouteOwner::PeeringConnection(connection.connection_id.clone())));
        }
        assert_eq!(cloud.tags(&connection.connection_id)["Name"], "alpha-to-bravo");
        assert_eq!(cloud.tags(&connection.connection_id)["Automated"], "true");
    }

    #[tokio::test]
    async fn test_direction_symmetry() {
        for requester_first in [true, false] {
            let cloud = FakeCloud::new();
            cloud.register(two_az_network(ACCOUNT, "vpc-a", "alpha"));
            cloud.register(two_az_network(OTHER_ACCOUNT, "vpc-b", "bravo"));

            let (first, second) = if requester_first {
                (("vpc-a", peering(true, "vpc-b")), ("vpc-b", peering(false, "vpc-a")))
            } else {
                (("vpc-b", peering(false, "vpc-a")), ("vpc-a", peering(true, "vpc-b")))
            };
            run(&cloud, first.0, &first.1).await.0.unwrap();
            let calls = cloud.mutations().len();
            run(&cloud, second.0, &second.1).await.0.unwrap();
            assert_eq!(cloud.mutations().len(), calls);

            let store = cloud.store();
            let a = store.network("vpc-a").state.peering_connections;
            let b = store.network("vpc-b").state.peering_connections;
            assert_eq!(a, b);
            assert_eq!(a[0].requester.network_id, "vpc-a");
            assert!(a[0].is_accepted);
            assert!(
                cloud
                    .mutations_by(OTHER_ACCOUNT)
                    .iter()
                    .any(|m| m.starts_with("accept_peering_connection"))
            );
        }
    }

    #[tokio::test]
    async fn test_removed_peering_is_torn_down() {
        let cloud = FakeCloud::new();
        cloud.register(two_az_network(ACCOUNT, "vpc-a", "alpha"));
        cloud.register(two_az_network(ACCOUNT, "vpc-b", "bravo"));
        run(&cloud, "vpc-a", &peering(true, "vpc-b")).await.0.unwrap();

        let (result, summary) = run(&cloud, "vpc-a", &NetworkingConfig::default()).await;
        result.unwrap();

        assert_eq!(summary.peerings_deleted, 1);
        let store = cloud.store();
        assert!(store.network("vpc-a").state.peering_connections.is_empty());
        assert!(store.network("vpc-b").state.peering_connections.is_empty());
        for rt in cloud.route_table_ids() {
            assert!(pcx_routes(&cloud, &rt).is_empty());
        }
    }

    #[tokio::test]
    async fn test_reversed_direction_replaces_connection() {
        let cloud = FakeCloud::new();
        cloud.register(two_az_network(ACCOUNT, "vpc-a", "alpha"));
        cloud.register(two_az_network(ACCOUNT, "vpc-b", "bravo"));
        run(&cloud, "vpc-a", &peering(true, "vpc-b")).await.0.unwrap();
        let old = cloud.store().network("vpc-a").state.peering_connections[0].clone();

        let (result, summary) = run(&cloud, "vpc-a", &peering(false, "vpc-b")).await;
        result.unwrap();

        assert_eq!(summary.peerings_deleted, 1);
        assert_eq!(summary.peerings_created, 1);
        let new = cloud.store().network("vpc-a").state.peering_connections[0].clone();
        assert_ne!(new.connection_id, old.connection_id);
        assert_eq!(new.requester.network_id, "vpc-b");

        let calls = cloud.mutations();
        let deleted_at = calls
            .iter()
            .position(|m| *m == format!("delete_peering_connection {}", old.connection_id))
            .unwrap();
        let created_at = calls
            .iter()
            .rposition(|m| m.starts_with("create_peering_connection"))
            .unwrap();
        assert!(deleted_at < created_at);
        assert_eq!(pcx_routes(&cloud, "rtb-vpc-a-private-a").len(), 2);
    }

    #[tokio::test]
    async fn test_deselected_side_loses_routes_but_keeps_connection() {
        let cloud = FakeCloud::new();
        cloud.register(two_az_network(ACCOUNT, "vpc-a", "alpha"));
        cloud.register(two_az_network(ACCOUNT, "vpc-b", "bravo"));
        run(&cloud, "vpc-a", &peering(true, "vpc-b")).await.0.unwrap();

        let mut config = peering(true, "vpc-b");
        config.peering_connections[0].connect = SubnetSelection::Nothing;
        let (result, summary) = run(&cloud, "vpc-a", &config).await;
        result.unwrap();

        assert_eq!(summary.routes.delete, 4);
        assert_eq!(summary.peerings_deleted, 0);
        assert!(pcx_routes(&cloud, "rtb-vpc-a-private-a").is_empty());
        assert_eq!(pcx_routes(&cloud, "rtb-vpc-b-private-a").len(), 2);
        assert_eq!(cloud.store().network("vpc-a").state.peering_connections.len(), 1);
    }

    #[tokio::test]
    async fn test_group_selection_routes_custom_tables() {
        let cloud = FakeCloud::new();
        cloud.register(
            NetworkBuilder::new(ACCOUNT, "vpc-a", "alpha")
                .azs(&["us-east-1a", "us-east-1b"])
                .private_subnets()
                .group("app", SubnetType::App)
                .build(),
        );
        cloud.register(two_az_network(ACCOUNT, "vpc-b", "bravo"));
        let mut config = peering(true, "vpc-b");
        config.peering_connections[0].connect = SubnetSelection::Groups(vec!["app".to_string()]);

        run(&cloud, "vpc-a", &config).await.0.unwrap();

        assert_eq!(pcx_routes(&cloud, "rtb-vpc-a-app-a").len(), 2);
        assert!(pcx_routes(&cloud, "rtb-vpc-a-private-a").is_empty());
        // The peer routes back to the app subnets only
        assert_eq!(pcx_routes(&cloud, "rtb-vpc-b-private-a").len(), 2);
    }
}
