//! Share - Expose resources to other accounts through resource shares
//!
//! Every mutation of a share runs under the `AddResourceShare` lock so two
//! passes never race on the same principal list. Shares are never deleted:
//! removing the last consumer only drops its principal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ReconcileContext;
use crate::error::ReconcileError;
use crate::network::Region;
use crate::provider::{ShareProvider, ShareStatus};
use crate::store::{LockSet, LockTarget, ensure_lock};
use crate::wait::{WaitTarget, await_condition, await_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareableKind {
    TransitGateway,
    ResolverRule,
    PrefixList,
}

impl ShareableKind {
    /// Prefix lists must be shared out of band; everything else may get a new share
    pub fn allows_auto_create(&self) -> bool {
        !matches!(self, ShareableKind::PrefixList)
    }
}

impl fmt::Display for ShareableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShareableKind::TransitGateway => "Transit Gateway",
            ShareableKind::ResolverRule => "Resolver Rule",
            ShareableKind::PrefixList => "Prefix List",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareableResource {
    pub kind: ShareableKind,
    pub id: String,
    pub owner_account: String,
    pub region: Region,
}

impl ShareableResource {
    pub fn new(
        kind: ShareableKind,
        id: impl Into<String>,
        owner_account: impl Into<String>,
        region: Region,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            owner_account: owner_account.into(),
            region,
        }
    }

    pub fn arn(&self) -> String {
        let partition = self.region.partition();
        match self.kind {
            ShareableKind::TransitGateway => format!(
                "arn:{}:ec2:{}:{}:transit-gateway/{}",
                partition, self.region, self.owner_account, self.id
            ),
            ShareableKind::PrefixList => format!(
                "arn:{}:ec2:{}:{}:prefix-list/{}",
                partition, self.region, self.owner_account, self.id
            ),
            ShareableKind::ResolverRule => format!(
                "arn:{}:route53resolver:{}:{}:resolver-rule/{}",
                partition, self.region, self.owner_account, self.id
            ),
        }
    }
}

/// ARN of a resource share from its ID
pub fn resource_share_arn(region: &Region, account_id: &str, share_id: &str) -> String {
    format!(
        "arn:{}:ram:{}:{}:resource-share/{}",
        region.partition(),
        region,
        account_id,
        share_id
    )
}

/// The ID portion of a resource share ARN
pub fn resource_share_id(share_arn: &str) -> &str {
    share_arn
        .rsplit_once("resource-share/")
        .map(|(_, id)| id)
        .unwrap_or(share_arn)
}

/// The rule ID of a resolver rule ARN; `None` for any other resource
pub fn resolver_rule_id(arn: &str) -> Option<&str> {
    arn.rsplit_once(":resolver-rule/").map(|(_, id)| id)
}

/// Resources from one owner to expose to `target_account`
pub struct ShareRequest<'a> {
    pub resources: &'a [ShareableResource],
    pub share_name: &'a str,
    pub known_share_arn: Option<String>,
    pub target_account: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareOutcome {
    pub share_arn: String,
    pub created: bool,
    pub principal_added: bool,
}

pub struct ShareCoordinator<'a> {
    ctx: &'a ReconcileContext,
    locks: &'a dyn LockSet,
}

impl<'a> ShareCoordinator<'a> {
    pub fn new(ctx: &'a ReconcileContext, locks: &'a dyn LockSet) -> Self {
        Self { ctx, locks }
    }

    /// Make sure `request.resources` are visible to the target account.
    ///
    /// `owner` and `target` are the share clients of the owning and the
    /// receiving account. Returns `None` when nothing needs sharing.
    pub async fn ensure_shared(
        &self,
        owner: &dyn ShareProvider,
        target: &dyn ShareProvider,
        request: &ShareRequest<'_>,
    ) -> Result<Option<ShareOutcome>, ReconcileError> {
        let Some(first) = request.resources.first() else {
            return Ok(None);
        };
        if first.owner_account == request.target_account {
            return Ok(None);
        }
        if let Some(other) = request
            .resources
            .iter()
            .find(|r| r.owner_account != first.owner_account)
        {
            return Err(ReconcileError::inconsistent(format!(
                "{} {} is owned by {}, not {}",
                other.kind, other.id, other.owner_account, first.owner_account
            )));
        }

        let acquired = ensure_lock(self.locks, &LockTarget::AddResourceShare).await?;
        let result = self.ensure_shared_locked(owner, target, request).await;
        if acquired {
            self.release_share_lock(result.is_ok()).await?;
        }
        result.map(Some)
    }

    async fn ensure_shared_locked(
        &self,
        owner: &dyn ShareProvider,
        target: &dyn ShareProvider,
        request: &ShareRequest<'_>,
    ) -> Result<ShareOutcome, ReconcileError> {
        let resource_arns: Vec<String> = request.resources.iter().map(|r| r.arn()).collect();
        let mut outcome = match self.find_share(owner, request, &resource_arns).await? {
            Some(share_arn) => {
                let shared = owner.share_resources(&share_arn).await?;
                let missing: Vec<String> = resource_arns
                    .iter()
                    .filter(|arn| !shared.contains(*arn))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    owner.associate_resources(&share_arn, &missing).await?;
                    tracing::info!(share = %share_arn, resources = ?missing, "added resources to share");
                }
                ShareOutcome {
                    share_arn,
                    created: false,
                    principal_added: false,
                }
            }
            None => {
                let first = &request.resources[0];
                if !first.kind.allows_auto_create() {
                    return Err(ReconcileError::UnsharedResource {
                        kind: first.kind,
                        resource_id: first.id.clone(),
                        owner_account: first.owner_account.clone(),
                    });
                }
                let share_arn = owner.create_share(request.share_name, &resource_arns).await?;
                tracing::info!(share = %share_arn, name = request.share_name, "created resource share");
                ShareOutcome {
                    share_arn,
                    created: true,
                    principal_added: false,
                }
            }
        };

        let principals = owner.share_principals(&outcome.share_arn).await?;
        if principals.iter().any(|p| p == request.target_account) {
            return Ok(outcome);
        }

        owner
            .associate_principal(&outcome.share_arn, request.target_account)
            .await?;
        outcome.principal_added = true;
        tracing::info!(
            share = %outcome.share_arn,
            principal = request.target_account,
            "added principal to share"
        );

        if !self.ctx.config.share.use_organizations {
            self.accept_invitation(target, &outcome.share_arn).await?;
        }
        self.wait_for_principal(owner, &outcome.share_arn, request.target_account)
            .await?;
        Ok(outcome)
    }

    async fn find_share(
        &self,
        owner: &dyn ShareProvider,
        request: &ShareRequest<'_>,
        resource_arns: &[String],
    ) -> Result<Option<String>, ReconcileError> {
        if let Some(known) = &request.known_share_arn {
            match owner.share_resources(known).await {
                Ok(_) => return Ok(Some(known.clone())),
                Err(e) if e.is_not_found() => {
                    tracing::warn!(share = %known, "recorded resource share no longer exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        for arn in resource_arns {
            if let Some(share_arn) = owner.owned_share_for_resource(arn).await? {
                return Ok(Some(share_arn));
            }
        }
        Ok(None)
    }

    /// Accept the share from the receiving account's side
    async fn accept_invitation(
        &self,
        target: &dyn ShareProvider,
        share_arn: &str,
    ) -> Result<(), ReconcileError> {
        let resource = format!("invitation to {}", share_arn);
        let wait = WaitTarget::new(&resource, "pending", self.ctx.wait().invitation_timeout());
        let status = await_status(
            self.ctx,
            &wait,
            &[ShareStatus::Active, ShareStatus::Pending],
            &[],
            || target.received_share_status(share_arn),
        )
        .await?;
        if status == ShareStatus::Active {
            return Ok(());
        }

        match target.pending_invitation(share_arn).await? {
            Some(invitation) => {
                target.accept_invitation(&invitation).await?;
                tracing::info!(share = %share_arn, invitation = %invitation, "accepted share invitation");
            }
            None => tracing::debug!(share = %share_arn, "invitation already accepted"),
        }
        Ok(())
    }

    async fn wait_for_principal(
        &self,
        owner: &dyn ShareProvider,
        share_arn: &str,
        principal: &str,
    ) -> Result<(), ReconcileError> {
        let resource = format!("principal {} on {}", principal, share_arn);
        let wait = WaitTarget::new(&resource, "associated", self.ctx.wait().principal_timeout());
        await_condition(self.ctx, &wait, || {
            Box::pin(async move {
                let principals = owner.share_principals(share_arn).await?;
                Ok(principals.iter().any(|p| p == principal))
            })
        })
        .await
    }

    /// Stop sharing with `target_account`. The share and its resources stay.
    pub async fn unshare(
        &self,
        owner: &dyn ShareProvider,
        share_arn: &str,
        target_account: &str,
    ) -> Result<bool, ReconcileError> {
        let acquired = ensure_lock(self.locks, &LockTarget::AddResourceShare).await?;
        let result: Result<bool, ReconcileError> = async {
            let principals = owner.share_principals(share_arn).await?;
            if !principals.iter().any(|p| p == target_account) {
                return Ok(false);
            }
            owner.disassociate_principal(share_arn, target_account).await?;
            tracing::info!(share = %share_arn, principal = target_account, "removed principal from share");
            Ok(true)
        }
        .await;
        if acquired {
            self.release_share_lock(result.is_ok()).await?;
        }
        result
    }

    async fn release_share_lock(&self, succeeded: bool) -> Result<(), ReconcileError> {
        match self.locks.release(&LockTarget::AddResourceShare).await {
            Ok(()) => Ok(()),
            Err(e) if succeeded => Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "failed to release share lock");
                Ok(())
            }
        }
    }
}
