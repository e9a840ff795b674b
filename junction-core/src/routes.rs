//! Applying route plans and locating the route tables that serve subnets

use std::collections::{BTreeMap, BTreeSet};

use crate::context::ReconcileContext;
use crate::differ::{RoutePlan, RoutePlanSummary, classify_routes, reconcile_routes};
use crate::error::ReconcileError;
use crate::network::{
    AvailabilityZone, NetworkState, Route, RouteDestination, RouteOwner, RouteTableAssociation,
    StateMutation, Subnet, SubnetType,
};
use crate::provider::NetworkProvider;
use crate::store::OperableNetwork;

/// A route table together with the subnets it serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutableTable {
    pub route_table_id: String,
    pub subnet_types: BTreeSet<SubnetType>,
    pub subnet_ids: BTreeSet<String>,
}

impl RoutableTable {
    pub fn serves_only(&self, subnet_type: SubnetType) -> bool {
        self.subnet_types.iter().all(|t| *t == subnet_type)
    }
}

/// The route table a subnet's traffic is routed by.
///
/// Custom tables win; public subnets use the per-AZ public table on
/// firewall networks and the network-wide one otherwise; everything else
/// uses the AZ's private table.
pub fn route_table_for_subnet<'a>(
    state: &'a NetworkState,
    az: &'a AvailabilityZone,
    subnet_type: SubnetType,
    subnet: &'a Subnet,
) -> Option<&'a str> {
    if let Some(custom) = subnet.custom_route_table_id.as_deref() {
        return Some(custom);
    }
    if subnet_type == SubnetType::Public {
        if state.network_type.has_firewall() {
            az.public_route_table_id.as_deref()
        } else {
            state.public_route_table_id.as_deref()
        }
    } else {
        az.private_route_table_id.as_deref()
    }
}

/// Every route table serving at least one subnet, each listed once
pub fn routable_tables(state: &NetworkState) -> Result<Vec<RoutableTable>, ReconcileError> {
    let mut tables: BTreeMap<&str, RoutableTable> = BTreeMap::new();
    for az in state.availability_zones.values() {
        for (subnet_type, subnets) in &az.subnets {
            for subnet in subnets {
                let rt_id = route_table_for_subnet(state, az, *subnet_type, subnet).ok_or_else(
                    || ReconcileError::inconsistent(format!("No route table for subnet {}", subnet.id)),
                )?;
                if !state.route_tables.contains_key(rt_id) {
                    return Err(ReconcileError::inconsistent(format!(
                        "Route table {} missing from state",
                        rt_id
                    )));
                }
                let entry = tables.entry(rt_id).or_insert_with(|| RoutableTable {
                    route_table_id: rt_id.to_string(),
                    subnet_types: BTreeSet::new(),
                    subnet_ids: BTreeSet::new(),
                });
                entry.subnet_types.insert(*subnet_type);
                entry.subnet_ids.insert(subnet.id.clone());
            }
        }
    }
    Ok(tables.into_values().collect())
}

/// Make `owner`'s routes in one table equal `desired`
pub async fn converge_routes(
    ctx: &ReconcileContext,
    network: &mut OperableNetwork,
    provider: &dyn NetworkProvider,
    route_table_id: &str,
    desired: &BTreeSet<RouteDestination>,
    owner: &RouteOwner,
) -> Result<RoutePlanSummary, ReconcileError> {
    let table = network.state().route_tables.get(route_table_id).ok_or_else(|| {
        ReconcileError::inconsistent(format!("Route table {} missing from state", route_table_id))
    })?;
    let plan = reconcile_routes(table, desired, owner)?;
    apply_route_plan(ctx, network, provider, &plan).await
}

/// Issue the plan's provider calls, committing state after each one
pub async fn apply_route_plan(
    ctx: &ReconcileContext,
    network: &mut OperableNetwork,
    provider: &dyn NetworkProvider,
    plan: &RoutePlan,
) -> Result<RoutePlanSummary, ReconcileError> {
    let rt_id = plan.route_table_id.as_str();

    for destination in &plan.deletes {
        ctx.check_live()?;
        match provider.delete_route(rt_id, destination).await {
            Ok(()) => {
                tracing::info!(route_table = rt_id, destination = %destination, "deleted route");
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(route_table = rt_id, destination = %destination, "route already gone");
            }
            Err(e) => return Err(e.into()),
        }
        network
            .commit(StateMutation::RemoveRoute {
                route_table_id: rt_id.to_string(),
                destination: destination.clone(),
            })
            .await?;
    }

    for handoff in &plan.replaces {
        ctx.check_live()?;
        match provider.replace_route(rt_id, &handoff.route).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => provider.create_route(rt_id, &handoff.route).await?,
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            route_table = rt_id,
            destination = %handoff.route.destination,
            owner = %handoff.route.owner,
            previous_owner = %handoff.previous_owner,
            "replaced route"
        );
        commit_put(network, rt_id, &handoff.route).await?;
    }

    for route in &plan.adds {
        ctx.check_live()?;
        match provider.create_route(rt_id, route).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => provider.replace_route(rt_id, route).await?,
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            route_table = rt_id,
            destination = %route.destination,
            owner = %route.owner,
            "created route"
        );
        commit_put(network, rt_id, route).await?;
    }

    Ok(plan.summary())
}

async fn commit_put(
    network: &mut OperableNetwork,
    route_table_id: &str,
    route: &Route,
) -> Result<(), ReconcileError> {
    network
        .commit(StateMutation::PutRoute {
            route_table_id: route_table_id.to_string(),
            route: route.clone(),
        })
        .await
}

/// Remove every route pointing at `owner` from the network's subnet route tables
pub async fn remove_owner_routes(
    ctx: &ReconcileContext,
    network: &mut OperableNetwork,
    provider: &dyn NetworkProvider,
    owner: &RouteOwner,
    skip_firewall: bool,
) -> Result<RoutePlanSummary, ReconcileError> {
    let mut summary = RoutePlanSummary::default();
    let empty = BTreeSet::new();
    for table in routable_tables(network.state())? {
        if skip_firewall && table.serves_only(SubnetType::Firewall) {
            continue;
        }
        let owns_routes = network
            .state()
            .route_tables
            .get(&table.route_table_id)
            .is_some_and(|rt| rt.routes_owned_by(owner).next().is_some());
        if !owns_routes {
            continue;
        }
        summary += converge_routes(ctx, network, provider, &table.route_table_id, &empty, owner).await?;
    }
    Ok(summary)
}

/// Re-read every known route table from the provider and record drift in state.
///
/// Returns the number of state mutations written.
pub async fn refresh_route_tables(
    ctx: &ReconcileContext,
    network: &mut OperableNetwork,
    provider: &dyn NetworkProvider,
) -> Result<usize, ReconcileError> {
    let mut written = 0;
    let tables: Vec<_> = network.state().route_tables.values().cloned().collect();
    for table in tables {
        ctx.check_live()?;
        let Some(observed) = provider.describe_route_table(&table.id).await? else {
            tracing::warn!(route_table = %table.id, "route table not found at provider");
            continue;
        };
        let (subnet_type, edge) = match table.association {
            Some(RouteTableAssociation::Subnet(t)) => (Some(t), None),
            Some(RouteTableAssociation::Edge(e)) => (None, Some(e)),
            None => (None, None),
        };
        let live = classify_routes(&observed, subnet_type, edge)?;

        for route in &table.routes {
            if live.route_for(&route.destination).is_none() {
                network
                    .commit(StateMutation::RemoveRoute {
                        route_table_id: table.id.clone(),
                        destination: route.destination.clone(),
                    })
                    .await?;
                written += 1;
            }
        }
        for route in &live.routes {
            if table.route_for(&route.destination) != Some(route) {
                commit_put(network, &table.id, route).await?;
                written += 1;
            }
        }
    }
    if written > 0 {
        tracing::info!(network = network.id(), changes = written, "recorded route drift");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeCloud, NetworkBuilder, test_context};
    use crate::network::NetworkType;

    fn pcx(id: &str) -> RouteOwner {
        RouteOwner::PeeringConnection(id.to_string())
    }

    fn dests(values: &[&str]) -> BTreeSet<RouteDestination> {
        values.iter().map(|v| RouteDestination::parse(*v)).collect()
    }

    #[test]
    fn test_route_table_selection() {
        let network = NetworkBuilder::new("111111111111", "vpc-a", "alpha")
            .azs(&["us-east-1a", "us-east-1b"])
            .private_subnets()
            .public_subnets()
            .group("app", SubnetType::App)
            .build();
        let tables = routable_tables(&network.state).unwrap();

        let ids: Vec<&str> = tables.iter().map(|t| t.route_table_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "rtb-vpc-a-app-a",
                "rtb-vpc-a-app-b",
                "rtb-vpc-a-private-a",
                "rtb-vpc-a-private-b",
                "rtb-vpc-a-public",
            ]
        );
        let public = tables.iter().find(|t| t.route_table_id == "rtb-vpc-a-public").unwrap();
        assert_eq!(public.subnet_ids.len(), 2);
        assert!(public.serves_only(SubnetType::Public));
    }

    #[test]
    fn test_firewall_network_uses_per_az_public_tables() {
        let network = NetworkBuilder::new("111111111111", "vpc-a", "alpha")
            .network_type(NetworkType::V1Firewall)
            .azs(&["us-east-1a", "us-east-1b"])
            .public_subnets()
            .build();
        let tables = routable_tables(&network.state).unwrap();
        let ids: Vec<&str> = tables.iter().map(|t| t.route_table_id.as_str()).collect();
        assert_eq!(ids, vec!["rtb-vpc-a-public-a", "rtb-vpc-a-public-b"]);
    }

    #[test]
    fn test_missing_route_table_is_inconsistent() {
        let mut network = NetworkBuilder::new("111111111111", "vpc-a", "alpha")
            .azs(&["us-east-1a"])
            .private_subnets()
            .build();
        network.state.route_tables.clear();
        let err = routable_tables(&network.state).unwrap_err();
        assert!(matches!(err, ReconcileError::Inconsistent(_)));
    }

    #[tokio::test]
    async fn test_converge_applies_and_commits() {
        let cloud = FakeCloud::new();
        let (ctx, _) = test_context();
        let (store, mut network) = cloud.operable(
            NetworkBuilder::new("111111111111", "vpc-a", "alpha")
                .azs(&["us-east-1a"])
                .private_subnets()
                .build(),
        );
        let provider = cloud.account("111111111111", "us-east-1");

        let summary = converge_routes(
            &ctx,
            &mut network,
            &provider,
            "rtb-vpc-a-private-a",
            &dests(&["10.1.0.0/24", "10.1.1.0/24"]),
            &pcx("pcx-1"),
        )
        .await
        .unwrap();
        assert_eq!(summary.add, 2);
        assert_eq!(cloud.routes("rtb-vpc-a-private-a").len(), 2);
        assert_eq!(
            store.network("vpc-a").state.route_tables["rtb-vpc-a-private-a"].routes.len(),
            2
        );

        let summary = converge_routes(
            &ctx,
            &mut network,
            &provider,
            "rtb-vpc-a-private-a",
            &dests(&["10.1.1.0/24"]),
            &pcx("pcx-1"),
        )
        .await
        .unwrap();
        assert_eq!(summary.delete, 1);
        assert_eq!(cloud.routes("rtb-vpc-a-private-a").len(), 1);
        assert_eq!(network.state().route_tables["rtb-vpc-a-private-a"].routes.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_vanished_route_still_updates_state() {
        let cloud = FakeCloud::new();
        let (ctx, _) = test_context();
        let mut built = NetworkBuilder::new("111111111111", "vpc-a", "alpha")
            .azs(&["us-east-1a"])
            .private_subnets()
            .build();
        // Recorded in state but never created at the provider
        built.state.apply(&StateMutation::PutRoute {
            route_table_id: "rtb-vpc-a-private-a".to_string(),
            route: Route::new("10.9.0.0/16", pcx("pcx-1")),
        });
        let (_, mut network) = cloud.operable(built);
        let provider = cloud.account("111111111111", "us-east-1");

        let summary = remove_owner_routes(&ctx, &mut network, &provider, &pcx("pcx-1"), true)
            .await
            .unwrap();
        assert_eq!(summary.delete, 1);
        assert!(network.state().route_tables["rtb-vpc-a-private-a"].routes.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_records_drift() {
        let cloud = FakeCloud::new();
        let (ctx, _) = test_context();
        let (_, mut network) = cloud.operable(
            NetworkBuilder::new("111111111111", "vpc-a", "alpha")
                .azs(&["us-east-1a"])
                .private_subnets()
                .build(),
        );
        cloud.seed_route(
            "rtb-vpc-a-private-a",
            Route::new("10.50.0.0/16", RouteOwner::TransitGateway("tgw-9".to_string())),
        );
        let provider = cloud.account("111111111111", "us-east-1");

        let written = refresh_route_tables(&ctx, &mut network, &provider).await.unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            network.state().route_tables["rtb-vpc-a-private-a"].routes[0].destination,
            RouteDestination::parse("10.50.0.0/16")
        );

        let written = refresh_route_tables(&ctx, &mut network, &provider).await.unwrap();
        assert_eq!(written, 0);
        assert!(cloud.mutations().is_empty());
    }
}
