//! Reconciler configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::Region;

/// Poll and timeout settings for provider waits (all values in seconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Delay between status polls (default: 1)
    pub poll_interval_secs: u64,

    /// Transit gateway attachments reaching available/deleted (default: 300)
    pub attachment_timeout_secs: u64,

    /// A shared transit gateway becoming visible and available (default: 300)
    pub transit_gateway_timeout_secs: u64,

    /// Peering connections reaching active/deleted (default: 300)
    pub peering_timeout_secs: u64,

    /// Resolver rules and associations settling (default: 300)
    pub resolver_timeout_secs: u64,

    /// A share invitation showing up in the target account (default: 300)
    pub invitation_timeout_secs: u64,

    /// A newly added principal being listed on the share (default: 60)
    pub principal_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            attachment_timeout_secs: 300,
            transit_gateway_timeout_secs: 300,
            peering_timeout_secs: 300,
            resolver_timeout_secs: 300,
            invitation_timeout_secs: 300,
            principal_timeout_secs: 60,
        }
    }
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn attachment_timeout(&self) -> Duration {
        Duration::from_secs(self.attachment_timeout_secs)
    }

    pub fn transit_gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.transit_gateway_timeout_secs)
    }

    pub fn peering_timeout(&self) -> Duration {
        Duration::from_secs(self.peering_timeout_secs)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_secs)
    }

    pub fn invitation_timeout(&self) -> Duration {
        Duration::from_secs(self.invitation_timeout_secs)
    }

    pub fn principal_timeout(&self) -> Duration {
        Duration::from_secs(self.principal_timeout_secs)
    }
}

/// Resource sharing options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Principals in the same organization see shares without an invitation
    pub use_organizations: bool,

    /// Account that owns the managed prefix lists in commercial regions
    pub prefix_list_account: Option<String>,

    /// Account that owns the managed prefix lists in GovCloud regions
    pub prefix_list_account_gov_cloud: Option<String>,
}

impl ShareConfig {
    pub fn prefix_list_account_for(&self, region: &Region) -> Option<&str> {
        if region.is_gov_cloud() {
            self.prefix_list_account_gov_cloud.as_deref()
        } else {
            self.prefix_list_account.as_deref()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub wait: WaitConfig,
    pub share: ShareConfig,
}
