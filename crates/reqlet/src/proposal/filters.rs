use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use super::ProposalManagerPlugin;
use crate::manager::{ManagerError, ProposalSource};
use crate::negotiation::RejectIfCostsExceeds;
use crate::resource::ProposalData;
use crate::scoring::Pricing;

type Check = Arc<dyn Fn(&ProposalData) -> Result<(), String> + Send + Sync>;

/// Skip offers failing `check`, rejecting the ones that are not initial.
fn filtered(name: &'static str, upstream: ProposalSource, check: Check) -> ProposalSource {
    Arc::new(move || {
        let upstream = Arc::clone(&upstream);
        let check = Arc::clone(&check);
        async move {
            loop {
                let proposal = upstream().await?;
                let data = proposal.data();
                let Err(reason) = check(&data) else {
                    return Ok::<_, ManagerError>(proposal);
                };

                tracing::debug!(
                    target: "reqlet::proposal",
                    filter = name,
                    proposal_id = %data.proposal_id,
                    issuer_id = %data.issuer_id,
                    %reason,
                    "Offer filtered out, picking another"
                );
                if !data.is_initial() {
                    proposal.reject(&reason).await?;
                }
            }
        }
        .boxed()
    })
}

pub struct BlacklistProviderIdPlugin {
    blacklist: Arc<HashSet<String>>,
}

impl BlacklistProviderIdPlugin {
    pub fn new<I, S>(blacklist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blacklist: Arc::new(blacklist.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl ProposalManagerPlugin for BlacklistProviderIdPlugin {
    async fn start(&self, upstream: ProposalSource) -> Result<ProposalSource, ManagerError> {
        let blacklist = Arc::clone(&self.blacklist);
        Ok(filtered(
            "blacklist",
            upstream,
            Arc::new(move |data: &ProposalData| {
                if blacklist.contains(&data.issuer_id) {
                    Err("provider_id on blacklist".to_string())
                } else {
                    Ok(())
                }
            }),
        ))
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        Ok(())
    }
}

pub struct WhitelistProviderIdPlugin {
    whitelist: Arc<HashSet<String>>,
}

impl WhitelistProviderIdPlugin {
    pub fn new<I, S>(whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: Arc::new(whitelist.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl ProposalManagerPlugin for WhitelistProviderIdPlugin {
    async fn start(&self, upstream: ProposalSource) -> Result<ProposalSource, ManagerError> {
        let whitelist = Arc::clone(&self.whitelist);
        Ok(filtered(
            "whitelist",
            upstream,
            Arc::new(move |data: &ProposalData| {
                if whitelist.contains(&data.issuer_id) {
                    Ok(())
                } else {
                    Err("provider_id is not on whitelist".to_string())
                }
            }),
        ))
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        Ok(())
    }
}

/// Skips offers whose estimated cost reaches the limit.
pub struct RejectIfCostsExceedsPlugin {
    limit: RejectIfCostsExceeds,
}

impl RejectIfCostsExceedsPlugin {
    pub fn new(cost: f64, pricing: Arc<dyn Pricing>) -> Self {
        Self {
            limit: RejectIfCostsExceeds::new(cost, pricing),
        }
    }

    pub fn with_reject_on_unpricable(mut self, reject: bool) -> Self {
        self.limit = self.limit.with_reject_on_unpricable(reject);
        self
    }
}

#[async_trait]
impl ProposalManagerPlugin for RejectIfCostsExceedsPlugin {
    async fn start(&self, upstream: ProposalSource) -> Result<ProposalSource, ManagerError> {
        let limit = Arc::new(self.limit.clone());
        Ok(filtered(
            "costs",
            upstream,
            Arc::new(move |data: &ProposalData| limit.check(data).map_err(|reject| reject.0)),
        ))
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        Ok(())
    }
}
