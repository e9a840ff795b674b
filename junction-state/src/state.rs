//! State file structures for persisting networks and the template catalog

use junction_core::network::{Network, Region};
use junction_core::template::{ManagedResolverRuleSet, TransitGatewayAttachmentTemplate, TransitGatewayShare};
use serde::{Deserialize, Serialize};

/// The main state file structure that persists to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of junction that last modified this state
    pub junction_version: String,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub catalog: Catalog,
}

/// Configured templates shared by every network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub transit_gateway_templates: Vec<TransitGatewayAttachmentTemplate>,
    #[serde(default)]
    pub resolver_rule_sets: Vec<ManagedResolverRuleSet>,
    #[serde(default)]
    pub transit_gateway_shares: Vec<TransitGatewayShare>,
}

impl Catalog {
    pub fn rule_set_mut(&mut self, id: u64) -> Option<&mut ManagedResolverRuleSet> {
        self.resolver_rule_sets.iter_mut().find(|s| s.id == id)
    }

    pub fn transit_gateway_share(&self, region: &Region, transit_gateway_id: &str) -> Option<&TransitGatewayShare> {
        self.transit_gateway_shares
            .iter()
            .find(|s| &s.region == region && s.transit_gateway_id == transit_gateway_id)
    }
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            junction_version: env!("CARGO_PKG_VERSION").to_string(),
            networks: Vec::new(),
            catalog: Catalog::default(),
        }
    }

    /// Increment serial and update junction version for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.junction_version = env!("CARGO_PKG_VERSION").to_string();
    }

    pub fn find_network(&self, region: &Region, network_id: &str) -> Option<&Network> {
        self.networks
            .iter()
            .find(|n| &n.region == region && n.id == network_id)
    }

    pub fn find_network_mut(&mut self, region: &Region, network_id: &str) -> Option<&mut Network> {
        self.networks
            .iter_mut()
            .find(|n| &n.region == region && n.id == network_id)
    }

    /// Add or replace a network
    pub fn upsert_network(&mut self, network: Network) {
        match self
            .networks
            .iter()
            .position(|n| n.region == network.region && n.id == network.id)
        {
            Some(pos) => self.networks[pos] = network,
            None => self.networks.push(network),
        }
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}
