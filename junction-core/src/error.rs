//! Error types returned by the reconcilers

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::network::{RouteDestination, RouteOwner, SubnetType};
use crate::provider::ProviderError;
use crate::share::ShareableKind;
use crate::store::StoreError;

/// Problems detected before any provider mutation is attempted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Route table {route_table_id} has both an edge association type and subnet type")]
    ConflictingAssociation { route_table_id: String },

    #[error("Route to {destination} in {route_table_id} has no target")]
    NoRouteTarget {
        route_table_id: String,
        destination: String,
    },

    #[error("Route to {destination} in {route_table_id} has more than one target")]
    AmbiguousRouteTarget {
        route_table_id: String,
        destination: String,
    },

    #[error("Could not assign unrecognized gateway ID {gateway_id}")]
    UnrecognizedGateway { gateway_id: String },

    #[error("Prefix list {destination} can only be routed through a transit gateway, not {owner}")]
    PrefixListOwner {
        destination: RouteDestination,
        owner: RouteOwner,
    },

    #[error("Peering connections for {subnet_type} subnet group {group} in {network_id} are not allowed")]
    SubnetGroupNotAllowed {
        network_id: String,
        group: String,
        subnet_type: SubnetType,
    },

    #[error("Peering connection to {network_id} is configured more than once")]
    DuplicatePeering { network_id: String },

    #[error("Invalid managed attachment ID: {0}")]
    UnknownTemplate(u64),

    #[error("Invalid resolver rule set ID: {0}")]
    UnknownRuleSet(u64),

    #[error("{what} {id} is in region {actual}, but the network is in {expected}")]
    RegionMismatch {
        what: &'static str,
        id: u64,
        expected: String,
        actual: String,
    },
}

/// Errors returned by a reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(
        "The configured {kind} {resource_id} is not yet shared. You must share the {kind} from account {owner_account} in the AWS Console first."
    )]
    UnsharedResource {
        kind: ShareableKind,
        resource_id: String,
        owner_account: String,
    },

    #[error("Routes for {subnet_type} subnets were not applied: {source}")]
    RoutesBlocked {
        subnet_type: SubnetType,
        #[source]
        source: Box<ReconcileError>,
    },

    #[error("Timed out after {waited:?} waiting for {resource} to become {expected}")]
    WaitTimeout {
        resource: String,
        expected: String,
        waited: Duration,
    },

    #[error("{resource} has unexpected status {status}")]
    UnexpectedStatus { resource: String, status: String },

    #[error("Reconciliation was cancelled")]
    Cancelled,

    #[error("Reconciliation deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Incomplete(#[from] PartialFailure),

    #[error("Inconsistent state: {0}")]
    Inconsistent(String),
}

impl ReconcileError {
    /// Whether this is the aggregate of per-item failures
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ReconcileError::Incomplete(_))
    }

    pub fn is_provider_not_found(&self) -> bool {
        matches!(self, ReconcileError::Provider(e) if e.is_not_found())
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        ReconcileError::Inconsistent(message.into())
    }
}

/// Per-item failures collected while the rest of a pass kept going
#[derive(Debug)]
pub struct PartialFailure {
    pub operation: &'static str,
    pub failures: Vec<ReconcileError>,
}

impl PartialFailure {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, error: ReconcileError) {
        tracing::warn!(operation = self.operation, error = %error, "recorded failure");
        self.failures.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok` when nothing was recorded
    pub fn into_result(self) -> Result<(), ReconcileError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::Incomplete(self))
        }
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Incomplete {}", self.operation)?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unshared_prefix_list_message() {
        let err = ReconcileError::UnsharedResource {
            kind: ShareableKind::PrefixList,
            resource_id: "pl-0123".to_string(),
            owner_account: "111111111111".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "The configured Prefix List pl-0123 is not yet shared. You must share the Prefix List from account 111111111111 in the AWS Console first."
        );
    }

    #[test]
    fn test_partial_failure_aggregate() {
        let mut failures = PartialFailure::new("resolver rule association processing");
        assert!(failures.is_empty());
        failures.record(ReconcileError::inconsistent("association rslvr-a vanished"));
        failures.record(ReconcileError::inconsistent("association rslvr-b vanished"));

        let err = failures.into_result().unwrap_err();
        assert!(err.is_incomplete());
        assert_eq!(
            err.to_string(),
            "Incomplete resolver rule association processing: Inconsistent state: association rslvr-a vanished; Inconsistent state: association rslvr-b vanished"
        );
    }

    #[test]
    fn test_empty_partial_failure_is_ok() {
        assert!(PartialFailure::new("routing").into_result().is_ok());
    }

    #[test]
    fn test_provider_not_found() {
        let err: ReconcileError = ProviderError::not_found("gone").into();
        assert!(err.is_provider_not_found());
        assert!(!err.is_incomplete());
    }
}
