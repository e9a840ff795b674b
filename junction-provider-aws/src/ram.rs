//! RAM resource share provider

use async_trait::async_trait;
use aws_sdk_ram::Client as RamClient;
use aws_sdk_ram::types::{ResourceOwner, ResourceShareAssociation, ResourceShareAssociationType};
use junction_core::provider::{ProviderError, ProviderResult, ShareProvider, ShareStatus};

use crate::error::sdk_error;

/// RAM rejects requests naming more resources than this
const MAX_RESOURCES_PER_CALL: usize = 100;

/// Resource ARNs split into request-sized batches; empty input yields one empty batch
fn batches(resource_arns: &[String]) -> Vec<&[String]> {
    if resource_arns.is_empty() {
        return vec![resource_arns];
    }
    resource_arns.chunks(MAX_RESOURCES_PER_CALL).collect()
}

/// Associations that are in place or on their way
fn is_live(association: &ResourceShareAssociation) -> bool {
    matches!(
        association.status().map(|s| s.as_str()),
        Some("ASSOCIATED") | Some("ASSOCIATING")
    )
}

/// `ShareProvider` backed by the RAM API of one account and region
pub struct RamShares {
    client: RamClient,
}

impl RamShares {
    pub fn new(client: RamClient) -> Self {
        Self { client }
    }

    /// Entities associated with a share, across all result pages
    async fn associated_entities(
        &self,
        share_arn: &str,
        association_type: ResourceShareAssociationType,
    ) -> ProviderResult<Vec<String>> {
        let mut entities = Vec::new();
        let mut next_token = None;
        loop {
            let output = self
                .client
                .get_resource_share_associations()
                .association_type(association_type.clone())
                .resource_share_arns(share_arn)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error("list resource share associations", share_arn, e))?;
            entities.extend(
                output
                    .resource_share_associations()
                    .iter()
                    .filter(|a| is_live(a))
                    .filter_map(|a| a.associated_entity().map(String::from)),
            );
            next_token = output.next_token().map(String::from);
            if next_token.is_none() {
                return Ok(entities);
            }
        }
    }

    async fn associate_batch(&self, share_arn: &str, resource_arns: &[String]) -> ProviderResult<()> {
        self.client
            .associate_resource_share()
            .resource_share_arn(share_arn)
            .set_resource_arns(Some(resource_arns.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_error("associate resources", share_arn, e))?;
        tracing::debug!(share = share_arn, resources = resource_arns.len(), "associated resources with share");
        Ok(())
    }
}

#[async_trait]
impl ShareProvider for RamShares {
    async fn owned_share_for_resource(&self, resource_arn: &str) -> ProviderResult<Option<String>> {
        let output = self
            .client
            .get_resource_share_associations()
            .association_type(ResourceShareAssociationType::Resource)
            .resource_arn(resource_arn)
            .send()
            .await
            .map_err(|e| sdk_error("find resource share", resource_arn, e))?;

        Ok(output
            .resource_share_associations()
            .iter()
            .filter(|a| is_live(a))
            .find_map(|a| a.resource_share_arn().map(String::from)))
    }

    async fn create_share(&self, name: &str, resource_arns: &[String]) -> ProviderResult<String> {
        let mut batches = batches(resource_arns).into_iter();
        let first = batches.next().unwrap_or_default();
        let output = self
            .client
            .create_resource_share()
            .name(name)
            .set_resource_arns(Some(first.to_vec()))
            .allow_external_principals(true)
            .send()
            .await
            .map_err(|e| sdk_error("create resource share", name, e))?;

        let share_arn = output
            .resource_share()
            .and_then(|s| s.resource_share_arn())
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::new("Resource share created but no ARN returned").for_resource(name)
            })?;

        for batch in batches {
            self.associate_batch(&share_arn, batch).await?;
        }
        Ok(share_arn)
    }

    async fn share_resources(&self, share_arn: &str) -> ProviderResult<Vec<String>> {
        self.associated_entities(share_arn, ResourceShareAssociationType::Resource)
            .await
    }

    async fn associate_resources(
        &self,
        share_arn: &str,
        resource_arns: &[String],
    ) -> ProviderResult<()> {
        for batch in batches(resource_arns) {
            self.associate_batch(share_arn, batch).await?;
        }
        Ok(())
    }

    async fn share_principals(&self, share_arn: &str) -> ProviderResult<Vec<String>> {
        self.associated_entities(share_arn, ResourceShareAssociationType::Principal)
            .await
    }

    async fn associate_principal(&self, share_arn: &str, principal: &str) -> ProviderResult<()> {
        self.client
            .associate_resource_share()
            .resource_share_arn(share_arn)
            .principals(principal)
            .send()
            .await
            .map_err(|e| sdk_error("associate principal", share_arn, e))?;
        Ok(())
    }

    async fn disassociate_principal(
        &self,
        share_arn: &str,
        principal: &str,
    ) -> ProviderResult<()> {
        self.client
            .disassociate_resource_share()
            .resource_share_arn(share_arn)
            .principals(principal)
            .send()
            .await
            .map_err(|e| sdk_error("disassociate principal", share_arn, e))?;
        Ok(())
    }

    async fn received_share_status(&self, share_arn: &str) -> ProviderResult<Option<ShareStatus>> {
        let output = self
            .client
            .get_resource_shares()
            .resource_owner(ResourceOwner::OtherAccounts)
            .resource_share_arns(share_arn)
            .send()
            .await
            .map_err(|e| sdk_error("describe received resource share", share_arn, e))?;

        if let Some(status) = output
            .resource_shares()
            .first()
            .and_then(|s| s.status())
        {
            return Ok(Some(ShareStatus::from_code(status.as_str())));
        }

        // Shares are invisible to the target until the invitation is accepted
        Ok(self
            .pending_invitation(share_arn)
            .await?
            .map(|_| ShareStatus::Pending))
    }

    async fn pending_invitation(&self, share_arn: &str) -> ProviderResult<Option<String>> {
        let output = self
            .client
            .get_resource_share_invitations()
            .resource_share_arns(share_arn)
            .send()
            .await
            .map_err(|e| sdk_error("list resource share invitations", share_arn, e))?;

        Ok(output
            .resource_share_invitations()
            .iter()
            .filter(|i| i.status().map(|s| s.as_str()) == Some("PENDING"))
            .find_map(|i| i.resource_share_invitation_arn().map(String::from)))
    }

    async fn accept_invitation(&self, invitation_arn: &str) -> ProviderResult<()> {
        self.client
            .accept_resource_share_invitation()
            .resource_share_invitation_arn(invitation_arn)
            .send()
            .await
            .map_err(|e| sdk_error("accept resource share invitation", invitation_arn, e))?;
        Ok(())
    }
}
