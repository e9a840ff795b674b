//! Route53 Resolver provider

use async_trait::async_trait;
use aws_sdk_route53resolver::Client as ResolverClient;
use aws_sdk_route53resolver::types::Filter;
use junction_core::provider::{
    ProviderError, ProviderResult, ResolverAssociationStatus, ResolverProvider,
    ResolverRuleStatus,
};

use crate::error::sdk_error;

/// `ResolverProvider` backed by the Route53 Resolver API of one account and region
pub struct Route53Resolver {
    client: ResolverClient,
}

impl Route53Resolver {
    pub fn new(client: ResolverClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResolverProvider for Route53Resolver {
    async fn resolver_rule_status(
        &self,
        rule_id: &str,
    ) -> ProviderResult<Option<ResolverRuleStatus>> {
        let result = self
            .client
            .get_resolver_rule()
            .resolver_rule_id(rule_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe resolver rule", rule_id, e));
        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(output
            .resolver_rule()
            .and_then(|rule| rule.status())
            .map(|status| ResolverRuleStatus::from_code(status.as_str())))
    }

    async fn associate_resolver_rule(
        &self,
        rule_id: &str,
        network_id: &str,
    ) -> ProviderResult<String> {
        let output = self
            .client
            .associate_resolver_rule()
            .resolver_rule_id(rule_id)
            .vpc_id(network_id)
            .send()
            .await
            .map_err(|e| sdk_error("associate resolver rule", rule_id, e))?;

        output
            .resolver_rule_association()
            .and_then(|a| a.id())
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::new("Resolver rule associated but no association ID returned")
                    .for_resource(rule_id)
            })
    }

    async fn disassociate_resolver_rule(
        &self,
        rule_id: &str,
        network_id: &str,
    ) -> ProviderResult<()> {
        self.client
            .disassociate_resolver_rule()
            .resolver_rule_id(rule_id)
            .vpc_id(network_id)
            .send()
            .await
            .map_err(|e| sdk_error("disassociate resolver rule", rule_id, e))?;
        Ok(())
    }

    async fn resolver_rule_association_status(
        &self,
        association_id: &str,
    ) -> ProviderResult<Option<ResolverAssociationStatus>> {
        let result = self
            .client
            .get_resolver_rule_association()
            .resolver_rule_association_id(association_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe resolver rule association", association_id, e));
        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(output
            .resolver_rule_association()
            .and_then(|a| a.status())
            .map(|status| ResolverAssociationStatus::from_code(status.as_str())))
    }

    async fn resolver_rule_association_count(&self, rule_id: &str) -> ProviderResult<usize> {
        let filter = Filter::builder()
            .name("ResolverRuleId")
            .values(rule_id)
            .build();
        let mut count = 0;
        let mut next_token = None;
        loop {
            let output = self
                .client
                .list_resolver_rule_associations()
                .filters(filter.clone())
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error("list resolver rule associations", rule_id, e))?;
            count += output.resolver_rule_associations().len();
            next_token = output.next_token().map(String::from);
            if next_token.is_none() {
                return Ok(count);
            }
        }
    }
}
