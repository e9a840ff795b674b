//! Configuration-time templates describing desired connectivity

use serde::{Deserialize, Serialize};

use crate::network::{Region, RouteDestination, Subnet, SubnetType};

/// A managed transit gateway attachment definition. Several templates may
/// target the same transit gateway; they merge into one physical attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitGatewayAttachmentTemplate {
    pub id: u64,
    pub name: String,
    pub transit_gateway_id: String,
    pub region: Region,
    #[serde(default)]
    pub routes: Vec<RouteDestination>,
    #[serde(default)]
    pub subnet_types: Vec<SubnetType>,
}

/// Which subnets on one side of a peering connection get routes to the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "groups", rename_all = "snake_case")]
pub enum SubnetSelection {
    AllPrivate,
    Groups(Vec<String>),
    #[default]
    Nothing,
}

impl SubnetSelection {
    pub fn selects(&self, subnet_type: SubnetType, subnet: &Subnet) -> bool {
        match self {
            SubnetSelection::AllPrivate => subnet_type == SubnetType::Private,
            SubnetSelection::Groups(groups) => {
                !subnet.group_name.is_empty() && groups.iter().any(|g| g == &subnet.group_name)
            }
            SubnetSelection::Nothing => false,
        }
    }

    pub fn named_groups(&self) -> &[String] {
        match self {
            SubnetSelection::Groups(groups) => groups,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringConnectionTemplate {
    /// Whether the configured network initiates the connection
    pub is_requester: bool,
    pub other_network_id: String,
    pub other_region: Region,
    #[serde(default)]
    pub connect: SubnetSelection,
    #[serde(default)]
    pub other_connect: SubnetSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverRule {
    pub id: u64,
    /// Provider-side rule ID (e.g., "rslvr-rr-...")
    pub provider_id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedResolverRuleSet {
    pub id: u64,
    pub name: String,
    pub region: Region,
    pub account_id: String,
    /// Existing resource share exposing the rules, if one is known
    #[serde(default)]
    pub resource_share_id: Option<String>,
    #[serde(default)]
    pub rules: Vec<ResolverRule>,
    #[serde(default)]
    pub in_use_networks: Vec<String>,
}

/// Owner of a transit gateway and the share that exposes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitGatewayShare {
    pub transit_gateway_id: String,
    pub region: Region,
    pub account_id: String,
    #[serde(default)]
    pub resource_share_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkingConfig {
    #[serde(default)]
    pub transit_gateway_templates: Vec<u64>,
    #[serde(default)]
    pub peering_connections: Vec<PeeringConnectionTemplate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverRulesConfig {
    #[serde(default)]
    pub rule_sets: Vec<u64>,
}
