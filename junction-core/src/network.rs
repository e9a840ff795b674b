//! Network - Durable model of one managed network and its connectivity
//!
//! A `Network` owns its `NetworkState`: route tables, per-AZ subnet layout,
//! and the realized peering connections, transit gateway attachments and
//! resolver rule associations. State only changes through `StateMutation`,
//! so the in-memory copy and the persisted copy apply identical edits.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Provider region (e.g., "us-east-1")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(String);

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_gov_cloud(&self) -> bool {
        self.0.starts_with("us-gov-")
    }

    /// ARN partition for resources in this region
    pub fn partition(&self) -> &'static str {
        if self.is_gov_cloud() {
            "aws-us-gov"
        } else {
            "aws"
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of subnet group inside a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubnetType {
    Private,
    Public,
    App,
    Data,
    Web,
    Transport,
    Transitive,
    Security,
    Management,
    Shared,
    #[serde(rename = "Shared-OC")]
    SharedOc,
    Unroutable,
    Firewall,
}

impl SubnetType {
    /// Every subnet type, in canonical order
    pub const ALL: [SubnetType; 13] = [
        SubnetType::Private,
        SubnetType::Public,
        SubnetType::App,
        SubnetType::Data,
        SubnetType::Web,
        SubnetType::Transport,
        SubnetType::Transitive,
        SubnetType::Security,
        SubnetType::Management,
        SubnetType::Shared,
        SubnetType::SharedOc,
        SubnetType::Unroutable,
        SubnetType::Firewall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetType::Private => "Private",
            SubnetType::Public => "Public",
            SubnetType::App => "App",
            SubnetType::Data => "Data",
            SubnetType::Web => "Web",
            SubnetType::Transport => "Transport",
            SubnetType::Transitive => "Transitive",
            SubnetType::Security => "Security",
            SubnetType::Management => "Management",
            SubnetType::Shared => "Shared",
            SubnetType::SharedOc => "Shared-OC",
            SubnetType::Unroutable => "Unroutable",
            SubnetType::Firewall => "Firewall",
        }
    }

    /// Whether subnets of this type may be selected by group name for peering
    pub fn allows_group_selection(&self) -> bool {
        !matches!(
            self,
            SubnetType::Private | SubnetType::Public | SubnetType::Unroutable | SubnetType::Firewall
        )
    }

    /// Unroutable and firewall subnets never carry transit gateway routes
    pub fn carries_transit_routes(&self) -> bool {
        !matches!(self, SubnetType::Unroutable | SubnetType::Firewall)
    }
}

impl fmt::Display for SubnetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkType {
    #[default]
    V1,
    V1Firewall,
    Legacy,
}

impl NetworkType {
    pub fn has_firewall(&self) -> bool {
        matches!(self, NetworkType::V1Firewall)
    }

    /// Subnet type preferred for transit gateway attachment ENIs
    pub fn attachment_subnet_type(&self) -> SubnetType {
        match self {
            NetworkType::Legacy => SubnetType::Transitive,
            _ => SubnetType::Private,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeAssociationType {
    InternetGateway,
}

/// Destination of a route: a CIDR block or a managed prefix list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RouteDestination {
    Cidr(String),
    PrefixList(String),
}

impl RouteDestination {
    /// Parse a destination; IDs starting with `pl-` are prefix lists
    pub fn parse(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.starts_with("pl-") {
            RouteDestination::PrefixList(value)
        } else {
            RouteDestination::Cidr(value)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RouteDestination::Cidr(s) | RouteDestination::PrefixList(s) => s,
        }
    }

    pub fn is_prefix_list(&self) -> bool {
        matches!(self, RouteDestination::PrefixList(_))
    }
}

impl From<String> for RouteDestination {
    fn from(value: String) -> Self {
        RouteDestination::parse(value)
    }
}

impl From<&str> for RouteDestination {
    fn from(value: &str) -> Self {
        RouteDestination::parse(value)
    }
}

impl From<RouteDestination> for String {
    fn from(value: RouteDestination) -> Self {
        match value {
            RouteDestination::Cidr(s) | RouteDestination::PrefixList(s) => s,
        }
    }
}

impl fmt::Display for RouteDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity a route sends traffic to. Routes are scoped by owner when diffing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RouteOwner {
    PeeringConnection(String),
    TransitGateway(String),
    InternetGateway(String),
    NatGateway(String),
    VpcEndpoint(String),
}

impl RouteOwner {
    pub fn id(&self) -> &str {
        match self {
            RouteOwner::PeeringConnection(id)
            | RouteOwner::TransitGateway(id)
            | RouteOwner::InternetGateway(id)
            | RouteOwner::NatGateway(id)
            | RouteOwner::VpcEndpoint(id) => id,
        }
    }

    /// Prefix list destinations can only be routed through a transit gateway
    pub fn accepts_prefix_lists(&self) -> bool {
        matches!(self, RouteOwner::TransitGateway(_))
    }
}

impl fmt::Display for RouteOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            RouteOwner::PeeringConnection(_) => "peering connection",
            RouteOwner::TransitGateway(_) => "transit gateway",
            RouteOwner::InternetGateway(_) => "internet gateway",
            RouteOwner::NatGateway(_) => "NAT gateway",
            RouteOwner::VpcEndpoint(_) => "VPC endpoint",
        };
        write!(f, "{} {}", kind, self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: RouteDestination,
    pub owner: RouteOwner,
}

impl Route {
    pub fn new(destination: impl Into<RouteDestination>, owner: RouteOwner) -> Self {
        Self {
            destination: destination.into(),
            owner,
        }
    }
}

/// What a route table is associated with. Subnet and edge associations are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RouteTableAssociation {
    Subnet(SubnetType),
    Edge(EdgeAssociationType),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub id: String,
    #[serde(default)]
    pub association: Option<RouteTableAssociation>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(id: impl Into<String>, association: Option<RouteTableAssociation>) -> Self {
        Self {
            id: id.into(),
            association,
            routes: Vec::new(),
        }
    }

    pub fn subnet_type(&self) -> Option<SubnetType> {
        match self.association {
            Some(RouteTableAssociation::Subnet(t)) => Some(t),
            _ => None,
        }
    }

    pub fn route_for(&self, destination: &RouteDestination) -> Option<&Route> {
        self.routes.iter().find(|r| &r.destination == destination)
    }

    /// Insert a route, replacing any route with the same destination
    pub fn put_route(&mut self, route: Route) {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.destination == route.destination)
        {
            *existing = route;
        } else {
            self.routes.push(route);
        }
    }

    pub fn remove_route(&mut self, destination: &RouteDestination) -> Option<Route> {
        let pos = self
            .routes
            .iter()
            .position(|r| &r.destination == destination)?;
        Some(self.routes.remove(pos))
    }

    pub fn routes_owned_by<'a>(&'a self, owner: &'a RouteOwner) -> impl Iterator<Item = &'a Route> {
        self.routes.iter().filter(move |r| &r.owner == owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub custom_route_table_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    #[serde(default)]
    pub subnets: BTreeMap<SubnetType, Vec<Subnet>>,
    #[serde(default)]
    pub private_route_table_id: Option<String>,
    /// Per-AZ public route table, only present on firewall networks
    #[serde(default)]
    pub public_route_table_id: Option<String>,
}

/// One endpoint of a peering connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub network_id: String,
    pub region: Region,
}

impl NetworkEndpoint {
    pub fn new(network_id: impl Into<String>, region: Region) -> Self {
        Self {
            network_id: network_id.into(),
            region,
        }
    }
}

impl fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.network_id)
    }
}

/// Unordered pair of endpoints identifying a peering relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeeringKey(NetworkEndpoint, NetworkEndpoint);

impl PeeringKey {
    pub fn new(a: NetworkEndpoint, b: NetworkEndpoint) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringConnection {
    pub requester: NetworkEndpoint,
    pub accepter: NetworkEndpoint,
    pub connection_id: String,
    #[serde(default)]
    pub is_accepted: bool,
}

impl PeeringConnection {
    pub fn key(&self) -> PeeringKey {
        PeeringKey::new(self.requester.clone(), self.accepter.clone())
    }

    /// The endpoint that is not `local`
    pub fn other_side(&self, local: &NetworkEndpoint) -> &NetworkEndpoint {
        if &self.requester == local {
            &self.accepter
        } else {
            &self.requester
        }
    }
}

/// The single physical attachment of a network to one transit gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitGatewayAttachment {
    pub transit_gateway_id: String,
    pub attachment_id: String,
    #[serde(default)]
    pub template_ids: BTreeSet<u64>,
    /// Name tag last written to the attachment
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverRuleAssociation {
    pub resolver_rule_id: String,
    pub association_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    #[serde(default)]
    pub network_type: NetworkType,
    /// Network-wide public route table (non-firewall networks)
    #[serde(default)]
    pub public_route_table_id: Option<String>,
    #[serde(default)]
    pub route_tables: BTreeMap<String, RouteTable>,
    #[serde(default)]
    pub availability_zones: BTreeMap<String, AvailabilityZone>,
    #[serde(default)]
    pub peering_connections: Vec<PeeringConnection>,
    #[serde(default)]
    pub transit_gateway_attachments: Vec<TransitGatewayAttachment>,
    #[serde(default)]
    pub resolver_rule_associations: Vec<ResolverRuleAssociation>,
}

/// Incremental edit to a `NetworkState`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateMutation {
    PutRoute {
        route_table_id: String,
        route: Route,
    },
    RemoveRoute {
        route_table_id: String,
        destination: RouteDestination,
    },
    PutPeeringConnection(PeeringConnection),
    RemovePeeringConnection(PeeringKey),
    PutTransitGatewayAttachment(TransitGatewayAttachment),
    RemoveTransitGatewayAttachment {
        transit_gateway_id: String,
    },
    PutResolverRuleAssociation(ResolverRuleAssociation),
    RemoveResolverRuleAssociation {
        resolver_rule_id: String,
    },
}

impl NetworkState {
    /// Apply a mutation. Puts replace the record with the same key.
    pub fn apply(&mut self, mutation: &StateMutation) {
        match mutation {
            StateMutation::PutRoute {
                route_table_id,
                route,
            } => {
                self.route_tables
                    .entry(route_table_id.clone())
                    .or_insert_with(|| RouteTable::new(route_table_id.clone(), None))
                    .put_route(route.clone());
            }
            StateMutation::RemoveRoute {
                route_table_id,
                destination,
            } => {
                if let Some(table) = self.route_tables.get_mut(route_table_id) {
                    table.remove_route(destination);
                }
            }
            StateMutation::PutPeeringConnection(connection) => {
                let key = connection.key();
                match self
                    .peering_connections
                    .iter_mut()
                    .find(|pc| pc.key() == key)
                {
                    Some(existing) => *existing = connection.clone(),
                    None => self.peering_connections.push(connection.clone()),
                }
            }
            StateMutation::RemovePeeringConnection(key) => {
                self.peering_connections.retain(|pc| &pc.key() != key);
            }
            StateMutation::PutTransitGatewayAttachment(attachment) => {
                match self
                    .transit_gateway_attachments
                    .iter_mut()
                    .find(|a| a.transit_gateway_id == attachment.transit_gateway_id)
                {
                    Some(existing) => *existing = attachment.clone(),
                    None => self.transit_gateway_attachments.push(attachment.clone()),
                }
            }
            StateMutation::RemoveTransitGatewayAttachment { transit_gateway_id } => {
                self.transit_gateway_attachments
                    .retain(|a| &a.transit_gateway_id != transit_gateway_id);
            }
            StateMutation::PutResolverRuleAssociation(association) => {
                match self
                    .resolver_rule_associations
                    .iter_mut()
                    .find(|a| a.resolver_rule_id == association.resolver_rule_id)
                {
                    Some(existing) => *existing = association.clone(),
                    None => self.resolver_rule_associations.push(association.clone()),
                }
            }
            StateMutation::RemoveResolverRuleAssociation { resolver_rule_id } => {
                self.resolver_rule_associations
                    .retain(|a| &a.resolver_rule_id != resolver_rule_id);
            }
        }
    }

    pub fn peering_connection(&self, key: &PeeringKey) -> Option<&PeeringConnection> {
        self.peering_connections.iter().find(|pc| &pc.key() == key)
    }

    pub fn transit_gateway_attachment(
        &self,
        transit_gateway_id: &str,
    ) -> Option<&TransitGatewayAttachment> {
        self.transit_gateway_attachments
            .iter()
            .find(|a| a.transit_gateway_id == transit_gateway_id)
    }

    pub fn resolver_rule_association(&self, rule_id: &str) -> Option<&ResolverRuleAssociation> {
        self.resolver_rule_associations
            .iter()
            .find(|a| a.resolver_rule_id == rule_id)
    }

    /// Iterate every subnet with its AZ name and type
    pub fn subnets(&self) -> impl Iterator<Item = (&str, SubnetType, &Subnet)> {
        self.availability_zones.iter().flat_map(|(az_name, az)| {
            az.subnets.iter().flat_map(move |(subnet_type, subnets)| {
                subnets
                    .iter()
                    .map(move |subnet| (az_name.as_str(), *subnet_type, subnet))
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub account_id: String,
    pub id: String,
    pub name: String,
    pub region: Region,
    pub state: NetworkState,
}

impl Network {
    pub fn endpoint(&self) -> NetworkEndpoint {
        NetworkEndpoint::new(self.id.clone(), self.region.clone())
    }
}
