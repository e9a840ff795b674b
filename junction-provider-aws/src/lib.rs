//! Junction AWS Provider
//!
//! EC2, RAM and Route53 Resolver implementations of the reconciler's
//! provider ports, and per-account client resolution through STS.

mod ec2;
mod error;
mod ram;
mod resolver;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region as SdkRegion, SdkConfig};
use junction_core::network::Region;
use junction_core::provider::{AccountAccess, AccountClients, ProviderError, ProviderResult};
use tokio::sync::Mutex;

pub use ec2::Ec2Network;
pub use ram::RamShares;
pub use resolver::Route53Resolver;

/// How to obtain credentials for a target account
#[derive(Debug, Clone)]
pub struct RoleConfig {
    /// Role assumed in every target account; `None` uses the ambient credentials for all accounts
    pub role_name: Option<String>,
    pub session_name: String,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            role_name: None,
            session_name: "junction".to_string(),
        }
    }
}

impl RoleConfig {
    pub fn role_arn(&self, region: &Region, account_id: &str) -> Option<String> {
        self.role_name.as_ref().map(|role| {
            format!(
                "arn:{}:iam::{}:role/{}",
                region.partition(),
                account_id,
                role
            )
        })
    }
}

/// Build the three provider ports from one SDK config
pub fn clients_from_config(config: &SdkConfig) -> AccountClients {
    AccountClients {
        network: Arc::new(Ec2Network::new(aws_sdk_ec2::Client::new(config))),
        share: Arc::new(RamShares::new(aws_sdk_ram::Client::new(config))),
        resolver: Arc::new(Route53Resolver::new(aws_sdk_route53resolver::Client::new(config))),
    }
}

/// `AccountAccess` assuming a role per account, caching clients per (account, region)
pub struct AwsAccountAccess {
    base: SdkConfig,
    role: RoleConfig,
    cache: Mutex<HashMap<(String, Region), AccountClients>>,
}

impl AwsAccountAccess {
    /// Load ambient credentials and configuration
    pub async fn new(role: RoleConfig) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::with_base_config(base, role)
    }

    pub fn with_base_config(base: SdkConfig, role: RoleConfig) -> Self {
        Self {
            base,
            role,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn load(&self, account_id: &str, region: &Region) -> ProviderResult<SdkConfig> {
        let sdk_region = SdkRegion::new(region.as_str().to_string());
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(sdk_region.clone());

        match self.role.role_arn(region, account_id) {
            Some(role_arn) => {
                tracing::debug!(account = account_id, role = %role_arn, "assuming role");
                let provider = AssumeRoleProvider::builder(role_arn)
                    .session_name(&self.role.session_name)
                    .region(sdk_region)
                    .configure(&self.base)
                    .build()
                    .await;
                loader = loader.credentials_provider(provider);
            }
            None => {
                let provider = self
                    .base
                    .credentials_provider()
                    .ok_or_else(|| ProviderError::no_credentials(account_id))?;
                loader = loader.credentials_provider(provider);
            }
        }

        Ok(loader.load().await)
    }
}

#[async_trait]
impl AccountAccess for AwsAccountAccess {
    async fn resolve(&self, account_id: &str, region: &Region) -> ProviderResult<AccountClients> {
        let key = (account_id.to_string(), region.clone());
        let mut cache = self.cache.lock().await;
        if let Some(clients) = cache.get(&key) {
            return Ok(clients.clone());
        }

        let config = self.load(account_id, region).await?;
        let clients = clients_from_config(&config);
        cache.insert(key, clients.clone());
        Ok(clients)
    }
}
