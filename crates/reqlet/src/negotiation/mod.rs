//! Automatic negotiation of demand terms against counter-offers.
//!
//! Each round runs the ordered [`Negotiator`] list over a copy of the current
//! demand terms. A negotiator may leave the terms alone, adjust them, or
//! reject the offer. Unchanged terms on a non-initial offer mean both sides
//! agree; anything else is sent back as a counter-proposal and the provider's
//! answer becomes the next round's offer.

mod filters;
mod mid_agreement;
mod payment_platform;

use std::sync::Arc;

use async_trait::async_trait;

use crate::manager::ManagerError;
use crate::resource::{DemandData, Proposal, ProposalData};

pub use filters::{BlacklistProviderIdNegotiator, RejectIfCostsExceeds};
pub use mid_agreement::{MidAgreementPaymentsConfig, MidAgreementPaymentsNegotiator};
pub use payment_platform::AddChosenPaymentPlatform;

/// Raised by a negotiator that refuses the offer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RejectProposal(pub String);

impl RejectProposal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Adjust `demand` in response to `offer`, or reject the offer.
    async fn negotiate(
        &self,
        demand: &mut DemandData,
        offer: &ProposalData,
    ) -> Result<(), RejectProposal>;
}

#[derive(Debug, Clone, Default)]
pub struct NegotiationConfig {
    /// With no negotiators configured, accept a pristine initial offer as is
    /// instead of sending one unchanged counter-proposal first.
    pub skip_pristine_initial: bool,
}

impl NegotiationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip_pristine_initial(mut self, skip: bool) -> Self {
        self.skip_pristine_initial = skip;
        self
    }
}

async fn run_negotiators(
    negotiators: &[Arc<dyn Negotiator>],
    demand: &mut DemandData,
    offer: &ProposalData,
) -> Result<(), RejectProposal> {
    for negotiator in negotiators {
        negotiator.negotiate(demand, offer).await?;
    }
    Ok(())
}

/// Negotiate `offer` to convergence and return the agreed draft.
///
/// A rejection fails only this branch: counter-offers are explicitly rejected
/// and [`ManagerError::Rejected`] is returned so the caller can move on to a
/// fresh offer. A response stream that closes before answering is
/// [`ManagerError::StreamClosed`].
pub async fn negotiate(
    offer: Proposal,
    negotiators: &[Arc<dyn Negotiator>],
    config: &NegotiationConfig,
) -> Result<Proposal, ManagerError> {
    let mut offer = offer;
    let mut demand = offer.demand().data();

    if config.skip_pristine_initial && negotiators.is_empty() && offer.is_initial() {
        tracing::debug!(target: "reqlet::negotiation", proposal_id = %offer.id(), "Accepting pristine initial offer");
        return Ok(offer);
    }

    loop {
        let offer_data = offer.data();
        let mut candidate = demand.clone();

        if let Err(rejection) = run_negotiators(negotiators, &mut candidate, &offer_data).await {
            tracing::info!(
                target: "reqlet::negotiation",
                proposal_id = %offer.id(),
                issuer_id = %offer_data.issuer_id,
                reason = %rejection,
                "Offer rejected"
            );
            if !offer_data.is_initial() {
                offer.reject(&rejection.0).await?;
            }
            return Err(ManagerError::Rejected {
                proposal_id: offer.id().to_string(),
                reason: rejection.0,
            });
        }

        if !offer_data.is_initial() && candidate == demand {
            tracing::info!(
                target: "reqlet::negotiation",
                proposal_id = %offer.id(),
                issuer_id = %offer_data.issuer_id,
                "Negotiation converged"
            );
            return Ok(offer);
        }

        demand = candidate;
        let ours = offer.respond(&demand).await?;
        tracing::debug!(
            target: "reqlet::negotiation",
            proposal_id = %offer.id(),
            response_id = %ours.id(),
            "Counter-proposal sent"
        );

        offer = ours
            .next_response()
            .await
            .ok_or_else(|| ManagerError::StreamClosed(ours.id().to_string()))?;
    }
}
