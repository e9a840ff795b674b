//! Provider - Narrow capability ports onto the cloud provider
//!
//! Reconcilers never talk to an SDK directly. They go through three ports:
//! `NetworkProvider` (routes, peering, transit gateways), `ShareProvider`
//! (cross-account resource shares) and `ResolverProvider` (DNS resolver
//! rules). `AccountAccess` hands out a set of these per account.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::network::{Region, Route, RouteDestination};

/// Broad classification of provider failures the reconcilers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    NotFound,
    AlreadyExists,
    NoCredentials,
    Other,
}

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub resource_id: Option<String>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Other,
            message: message.into(),
            resource_id: None,
            cause: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ProviderErrorKind::NotFound)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ProviderErrorKind::AlreadyExists)
    }

    pub fn no_credentials(account_id: &str) -> Self {
        Self::new(format!("no credentials available for account {}", account_id))
            .with_kind(ProviderErrorKind::NoCredentials)
    }

    pub fn with_kind(mut self, kind: ProviderErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn for_resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ProviderErrorKind::AlreadyExists
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn from_code(code: &str) -> Self {
                match code {
                    $($code => $name::$variant,)+
                    other => $name::Other(other.to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $code,)+
                    $name::Other(code) => code,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// Peering connection status codes
    PeeringStatus {
        InitiatingRequest => "initiating-request",
        PendingAcceptance => "pending-acceptance",
        Provisioning => "provisioning",
        Active => "active",
        Deleting => "deleting",
        Deleted => "deleted",
        Rejected => "rejected",
        Failed => "failed",
        Expired => "expired",
    }
);

status_enum!(
    /// Transit gateway attachment states
    AttachmentStatus {
        Pending => "pending",
        PendingAcceptance => "pendingAcceptance",
        Available => "available",
        Modifying => "modifying",
        Deleting => "deleting",
        Deleted => "deleted",
        Failed => "failed",
        Rejected => "rejected",
    }
);

status_enum!(
    TransitGatewayStatus {
        Pending => "pending",
        Available => "available",
        Modifying => "modifying",
        Deleting => "deleting",
        Deleted => "deleted",
    }
);

status_enum!(
    ResolverRuleStatus {
        Complete => "COMPLETE",
        Creating => "CREATING",
        Updating => "UPDATING",
        Deleting => "DELETING",
        Failed => "FAILED",
    }
);

status_enum!(
    ResolverAssociationStatus {
        Creating => "CREATING",
        Complete => "COMPLETE",
        Deleting => "DELETING",
        Failed => "FAILED",
        Overridden => "OVERRIDDEN",
    }
);

status_enum!(
    /// Status of a resource share as seen by an account
    ShareStatus {
        Pending => "PENDING",
        Active => "ACTIVE",
        Failed => "FAILED",
        Deleting => "DELETING",
        Deleted => "DELETED",
    }
);

/// How a route got into a route table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteOrigin {
    #[default]
    CreateRoute,
    CreateRouteTable,
    Propagated,
}

/// A route exactly as the provider reports it, before classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedRoute {
    pub origin: RouteOrigin,
    pub destination_cidr_block: Option<String>,
    pub destination_prefix_list_id: Option<String>,
    pub gateway_id: Option<String>,
    pub nat_gateway_id: Option<String>,
    pub transit_gateway_id: Option<String>,
    pub vpc_peering_connection_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedRouteTable {
    pub id: String,
    pub routes: Vec<ObservedRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringRequest {
    pub requester_network_id: String,
    pub accepter_network_id: String,
    pub accepter_account_id: String,
    pub accepter_region: Region,
}

/// EC2-like network resource operations
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    async fn describe_route_table(
        &self,
        route_table_id: &str,
    ) -> ProviderResult<Option<ObservedRouteTable>>;

    async fn create_route(&self, route_table_id: &str, route: &Route) -> ProviderResult<()>;

    /// Point an existing destination at a new target
    async fn replace_route(&self, route_table_id: &str, route: &Route) -> ProviderResult<()>;

    async fn delete_route(
        &self,
        route_table_id: &str,
        destination: &RouteDestination,
    ) -> ProviderResult<()>;

    /// Returns the new connection ID
    async fn create_peering_connection(&self, request: &PeeringRequest) -> ProviderResult<String>;

    async fn accept_peering_connection(&self, connection_id: &str) -> ProviderResult<()>;

    async fn delete_peering_connection(&self, connection_id: &str) -> ProviderResult<()>;

    async fn peering_connection_status(
        &self,
        connection_id: &str,
    ) -> ProviderResult<Option<PeeringStatus>>;

    /// Returns the new attachment ID
    async fn create_transit_gateway_attachment(
        &self,
        transit_gateway_id: &str,
        network_id: &str,
        subnet_ids: &[String],
    ) -> ProviderResult<String>;

    async fn modify_transit_gateway_attachment(
        &self,
        attachment_id: &str,
        add_subnet_ids: &[String],
        remove_subnet_ids: &[String],
    ) -> ProviderResult<()>;

    async fn delete_transit_gateway_attachment(&self, attachment_id: &str) -> ProviderResult<()>;

    async fn accept_transit_gateway_attachment(&self, attachment_id: &str) -> ProviderResult<()>;

    async fn transit_gateway_attachment_status(
        &self,
        attachment_id: &str,
    ) -> ProviderResult<Option<AttachmentStatus>>;

    async fn transit_gateway_status(
        &self,
        transit_gateway_id: &str,
    ) -> ProviderResult<Option<TransitGatewayStatus>>;

    async fn tag_resource(
        &self,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> ProviderResult<()>;

    async fn subnet_cidr(&self, subnet_id: &str) -> ProviderResult<String>;
}

/// RAM-like resource sharing operations
///
/// Owner-side calls take the share ARN; target-side calls report what the
/// calling account sees of a share it has been invited to.
#[async_trait]
pub trait ShareProvider: Send + Sync {
    /// Share owned by the calling account that contains the resource
    async fn owned_share_for_resource(&self, resource_arn: &str) -> ProviderResult<Option<String>>;

    /// Returns the new share ARN
    async fn create_share(&self, name: &str, resource_arns: &[String]) -> ProviderResult<String>;

    async fn share_resources(&self, share_arn: &str) -> ProviderResult<Vec<String>>;

    async fn associate_resources(
        &self,
        share_arn: &str,
        resource_arns: &[String],
    ) -> ProviderResult<()>;

    async fn share_principals(&self, share_arn: &str) -> ProviderResult<Vec<String>>;

    async fn associate_principal(&self, share_arn: &str, principal: &str) -> ProviderResult<()>;

    async fn disassociate_principal(&self, share_arn: &str, principal: &str)
    -> ProviderResult<()>;

    async fn received_share_status(&self, share_arn: &str) -> ProviderResult<Option<ShareStatus>>;

    /// ARN of a pending invitation to the share, if any
    async fn pending_invitation(&self, share_arn: &str) -> ProviderResult<Option<String>>;

    async fn accept_invitation(&self, invitation_arn: &str) -> ProviderResult<()>;
}

/// Route53Resolver-like operations
#[async_trait]
pub trait ResolverProvider: Send + Sync {
    async fn resolver_rule_status(&self, rule_id: &str)
    -> ProviderResult<Option<ResolverRuleStatus>>;

    /// Returns the new association ID
    async fn associate_resolver_rule(&self, rule_id: &str, network_id: &str)
    -> ProviderResult<String>;

    async fn disassociate_resolver_rule(&self, rule_id: &str, network_id: &str)
    -> ProviderResult<()>;

    async fn resolver_rule_association_status(
        &self,
        association_id: &str,
    ) -> ProviderResult<Option<ResolverAssociationStatus>>;

    /// Number of networks the rule is associated with, as visible to the caller
    async fn resolver_rule_association_count(&self, rule_id: &str) -> ProviderResult<usize>;
}

/// Capability handles for one account in one region
#[derive(Clone)]
pub struct AccountClients {
    pub network: Arc<dyn NetworkProvider>,
    pub share: Arc<dyn ShareProvider>,
    pub resolver: Arc<dyn ResolverProvider>,
}

/// Resolves per-account capability handles
///
/// Fails with `ProviderErrorKind::NoCredentials` when the account cannot be assumed.
#[async_trait]
pub trait AccountAccess: Send + Sync {
    async fn resolve(&self, account_id: &str, region: &Region) -> ProviderResult<AccountClients>;
}
