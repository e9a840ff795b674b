//! SDK error classification

use std::fmt::Debug;

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use junction_core::provider::{ProviderError, ProviderErrorKind};

/// Error codes meaning the addressed resource does not exist
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidRoute.NotFound",
    "InvalidRouteTableID.NotFound",
    "InvalidVpcPeeringConnectionID.NotFound",
    "InvalidTransitGatewayAttachmentID.NotFound",
    "InvalidTransitGatewayID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidVpcID.NotFound",
    "ResourceNotFoundException",
    "UnknownResourceException",
    "ResourceShareInvitationArnNotFoundException",
];

/// Error codes meaning the resource being created is already there
const ALREADY_EXISTS_CODES: &[&str] = &["RouteAlreadyExists", "ResourceExistsException"];

const NO_CREDENTIALS_CODES: &[&str] = &[
    "AuthFailure",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
    "ExpiredToken",
    "AccessDenied",
];

pub(crate) fn classify(code: Option<&str>) -> ProviderErrorKind {
    match code {
        Some(code) if NOT_FOUND_CODES.contains(&code) => ProviderErrorKind::NotFound,
        Some(code) if ALREADY_EXISTS_CODES.contains(&code) => ProviderErrorKind::AlreadyExists,
        Some(code) if NO_CREDENTIALS_CODES.contains(&code) => ProviderErrorKind::NoCredentials,
        _ => ProviderErrorKind::Other,
    }
}

/// Convert an SDK failure of `action` on `resource_id` into a `ProviderError`
pub(crate) fn sdk_error<E, R>(action: &str, resource_id: &str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    let kind = classify(err.code());
    let detail = match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code.to_string(),
        _ => err.to_string(),
    };
    ProviderError::new(format!("Failed to {}: {}", action, detail))
        .with_kind(kind)
        .for_resource(resource_id)
        .with_cause(err)
}
