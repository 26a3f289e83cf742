use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Negotiator, RejectProposal};
use crate::resource::{DemandData, ProposalData};
use crate::scoring::Pricing;

/// Rejects offers issued by any of the listed providers.
#[derive(Debug, Clone, Default)]
pub struct BlacklistProviderIdNegotiator {
    blacklist: HashSet<String>,
}

impl BlacklistProviderIdNegotiator {
    pub fn new<I, S>(blacklist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blacklist: blacklist.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Negotiator for BlacklistProviderIdNegotiator {
    async fn negotiate(
        &self,
        _demand: &mut DemandData,
        offer: &ProposalData,
    ) -> Result<(), RejectProposal> {
        if self.blacklist.contains(&offer.issuer_id) {
            return Err(RejectProposal::new(format!(
                "Provider `{}` is blacklisted",
                offer.issuer_id
            )));
        }
        Ok(())
    }
}

/// Rejects offers whose price reaches `cost`.
#[derive(Clone)]
pub struct RejectIfCostsExceeds {
    cost: f64,
    pricing: Arc<dyn Pricing>,
    reject_on_unpricable: bool,
}

impl RejectIfCostsExceeds {
    pub fn new(cost: f64, pricing: Arc<dyn Pricing>) -> Self {
        Self {
            cost,
            pricing,
            reject_on_unpricable: true,
        }
    }

    pub fn with_reject_on_unpricable(mut self, reject: bool) -> Self {
        self.reject_on_unpricable = reject;
        self
    }

    pub(crate) fn check(&self, offer: &ProposalData) -> Result<(), RejectProposal> {
        match self.pricing.price(offer) {
            None if self.reject_on_unpricable => Err(RejectProposal::new(
                "Can't estimate costs of the offer",
            )),
            None => Ok(()),
            Some(cost) if self.cost <= cost => Err(RejectProposal::new(format!(
                "Offer cost {cost} exceeds the limit of {}",
                self.cost
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Negotiator for RejectIfCostsExceeds {
    async fn negotiate(
        &self,
        _demand: &mut DemandData,
        offer: &ProposalData,
    ) -> Result<(), RejectProposal> {
        self.check(offer)
    }
}
