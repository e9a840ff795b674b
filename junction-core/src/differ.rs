//! Differ - Compare a route table's routes with the desired set for one owner
//!
//! Diffing is always scoped to a single `RouteOwner`: only routes that point
//! at that owner can be deleted. A desired destination currently routed
//! through someone else is handed over with a replace, never a delete+add.

use std::collections::BTreeSet;

use crate::error::ValidationError;
use crate::network::{
    EdgeAssociationType, Route, RouteDestination, RouteOwner, RouteTable, RouteTableAssociation,
    SubnetType,
};
use crate::provider::{ObservedRoute, ObservedRouteTable, RouteOrigin};

/// A destination taken over from another owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHandOff {
    pub route: Route,
    pub previous_owner: RouteOwner,
}

/// Changes needed to bring one route table in line for one owner.
///
/// Apply order is deletes, then replaces, then adds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub route_table_id: String,
    pub adds: Vec<Route>,
    pub replaces: Vec<RouteHandOff>,
    pub deletes: Vec<RouteDestination>,
}

impl RoutePlan {
    pub fn new(route_table_id: impl Into<String>) -> Self {
        Self {
            route_table_id: route_table_id.into(),
            adds: Vec::new(),
            replaces: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.replaces.is_empty() && self.deletes.is_empty()
    }

    pub fn summary(&self) -> RoutePlanSummary {
        RoutePlanSummary {
            add: self.adds.len(),
            replace: self.replaces.len(),
            delete: self.deletes.len(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoutePlanSummary {
    pub add: usize,
    pub replace: usize,
    pub delete: usize,
}

impl RoutePlanSummary {
    pub fn is_empty(&self) -> bool {
        self.add == 0 && self.replace == 0 && self.delete == 0
    }
}

impl std::ops::AddAssign for RoutePlanSummary {
    fn add_assign(&mut self, other: Self) {
        self.add += other.add;
        self.replace += other.replace;
        self.delete += other.delete;
    }
}

impl std::fmt::Display for RoutePlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Routes: {} to add, {} to replace, {} to delete",
            self.add, self.replace, self.delete
        )
    }
}

/// Compute the plan that makes `owner`'s routes in `table` equal `desired`
pub fn reconcile_routes(
    table: &RouteTable,
    desired: &BTreeSet<RouteDestination>,
    owner: &RouteOwner,
) -> Result<RoutePlan, ValidationError> {
    let mut plan = RoutePlan::new(&table.id);

    for destination in desired {
        if destination.is_prefix_list() && !owner.accepts_prefix_lists() {
            return Err(ValidationError::PrefixListOwner {
                destination: destination.clone(),
                owner: owner.clone(),
            });
        }

        match table.route_for(destination) {
            Some(existing) if &existing.owner == owner => {}
            Some(existing) => plan.replaces.push(RouteHandOff {
                route: Route::new(destination.clone(), owner.clone()),
                previous_owner: existing.owner.clone(),
            }),
            None => plan
                .adds
                .push(Route::new(destination.clone(), owner.clone())),
        }
    }

    plan.deletes = table
        .routes_owned_by(owner)
        .filter(|r| !desired.contains(&r.destination))
        .map(|r| r.destination.clone())
        .collect();

    Ok(plan)
}

/// Turn a provider route table into the persisted model.
///
/// Only routes created through `CreateRoute` are kept; local and propagated
/// routes are not ours to manage.
pub fn classify_routes(
    observed: &ObservedRouteTable,
    subnet_type: Option<SubnetType>,
    edge_association: Option<EdgeAssociationType>,
) -> Result<RouteTable, ValidationError> {
    let association = match (subnet_type, edge_association) {
        (Some(_), Some(_)) => {
            return Err(ValidationError::ConflictingAssociation {
                route_table_id: observed.id.clone(),
            });
        }
        (Some(t), None) => Some(RouteTableAssociation::Subnet(t)),
        (None, Some(e)) => Some(RouteTableAssociation::Edge(e)),
        (None, None) => None,
    };

    let mut table = RouteTable::new(&observed.id, association);
    for route in &observed.routes {
        if route.origin != RouteOrigin::CreateRoute {
            continue;
        }
        let destination = match route
            .destination_cidr_block
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(route.destination_prefix_list_id.as_deref().filter(|s| !s.is_empty()))
        {
            Some(d) => RouteDestination::parse(d),
            None => continue,
        };
        let owner = classify_owner(&observed.id, &destination, route)?;
        table.put_route(Route { destination, owner });
    }
    Ok(table)
}

fn classify_owner(
    route_table_id: &str,
    destination: &RouteDestination,
    route: &ObservedRoute,
) -> Result<RouteOwner, ValidationError> {
    let mut owners = Vec::new();
    if let Some(id) = non_empty(&route.nat_gateway_id) {
        owners.push(RouteOwner::NatGateway(id.to_string()));
    }
    if let Some(id) = non_empty(&route.transit_gateway_id) {
        owners.push(RouteOwner::TransitGateway(id.to_string()));
    }
    if let Some(id) = non_empty(&route.vpc_peering_connection_id) {
        owners.push(RouteOwner::PeeringConnection(id.to_string()));
    }
    if let Some(id) = non_empty(&route.gateway_id) {
        owners.push(classify_gateway(id)?);
    }

    match owners.len() {
        0 => Err(ValidationError::NoRouteTarget {
            route_table_id: route_table_id.to_string(),
            destination: destination.to_string(),
        }),
        1 => Ok(owners.remove(0)),
        _ => Err(ValidationError::AmbiguousRouteTarget {
            route_table_id: route_table_id.to_string(),
            destination: destination.to_string(),
        }),
    }
}

fn classify_gateway(gateway_id: &str) -> Result<RouteOwner, ValidationError> {
    if gateway_id.starts_with("igw-") {
        Ok(RouteOwner::InternetGateway(gateway_id.to_string()))
    } else if gateway_id.starts_with("vpce-") {
        Ok(RouteOwner::VpcEndpoint(gateway_id.to_string()))
    } else {
        Err(ValidationError::UnrecognizedGateway {
            gateway_id: gateway_id.to_string(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}
