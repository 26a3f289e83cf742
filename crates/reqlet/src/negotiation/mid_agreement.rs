use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Negotiator, RejectProposal};
use crate::resource::{DEBIT_NOTE_INTERVAL, DemandData, PAYMENT_TIMEOUT, ProposalData};

#[derive(Debug, Clone)]
pub struct MidAgreementPaymentsConfig {
    pub min_debit_note_interval: Duration,
    pub requested_debit_note_interval: Duration,
    pub min_payment_timeout: Duration,
    pub requested_payment_timeout: Duration,
    /// Smallest step by which a counter moves towards the provider's value.
    pub min_adjustment: u64,
    /// The remaining gap is divided by this on every round.
    pub adjustment_factor: u64,
}

impl Default for MidAgreementPaymentsConfig {
    fn default() -> Self {
        Self {
            min_debit_note_interval: Duration::from_secs(60),
            requested_debit_note_interval: Duration::from_secs(600),
            min_payment_timeout: Duration::from_secs(120),
            requested_payment_timeout: Duration::from_secs(24 * 60 * 60),
            min_adjustment: 1,
            adjustment_factor: 3,
        }
    }
}

impl MidAgreementPaymentsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debit_note_interval(mut self, min: Duration, requested: Duration) -> Self {
        self.min_debit_note_interval = min;
        self.requested_debit_note_interval = requested;
        self
    }

    pub fn with_payment_timeout(mut self, min: Duration, requested: Duration) -> Self {
        self.min_payment_timeout = min;
        self.requested_payment_timeout = requested;
        self
    }

    pub fn with_adjustment(mut self, min_adjustment: u64, adjustment_factor: u64) -> Self {
        self.min_adjustment = min_adjustment;
        self.adjustment_factor = adjustment_factor.max(1);
        self
    }
}

/// Negotiates debit-note interval and payment timeout for mid-agreement payments.
///
/// Each round moves our value a fraction of the way towards the provider's,
/// never below the configured minimum. Once our value sits at the minimum and
/// the provider still asks for less, the offer is rejected.
#[derive(Debug, Clone, Default)]
pub struct MidAgreementPaymentsNegotiator {
    config: MidAgreementPaymentsConfig,
}

impl MidAgreementPaymentsNegotiator {
    pub fn new(config: MidAgreementPaymentsConfig) -> Self {
        Self { config }
    }

    fn next_value(
        &self,
        name: &str,
        offered: u64,
        previous: Option<u64>,
        minimal: u64,
        requested: u64,
    ) -> Result<u64, RejectProposal> {
        let Some(previous) = previous else {
            return Ok(offered.max(requested));
        };
        if offered >= previous {
            return Ok(offered);
        }
        if previous == minimal {
            return Err(RejectProposal::new(format!(
                "Proposed {name} is too short: {offered}s, minimum is {minimal}s"
            )));
        }
        let step = self
            .config
            .min_adjustment
            .max((previous - offered) / self.config.adjustment_factor.max(1));
        let lowered = previous.saturating_sub(step);
        Ok(lowered.max(minimal).max(offered))
    }
}

fn seconds(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
}

#[async_trait]
impl Negotiator for MidAgreementPaymentsNegotiator {
    async fn negotiate(
        &self,
        demand: &mut DemandData,
        offer: &ProposalData,
    ) -> Result<(), RejectProposal> {
        let (Some(offered_interval), Some(offered_timeout)) = (
            seconds(offer.properties.get(DEBIT_NOTE_INTERVAL)),
            seconds(offer.properties.get(PAYMENT_TIMEOUT)),
        ) else {
            return Err(RejectProposal::new("Mid-agreement payments are not supported"));
        };

        let our_interval = seconds(demand.properties.get(DEBIT_NOTE_INTERVAL));
        let our_timeout = seconds(demand.properties.get(PAYMENT_TIMEOUT));
        if our_interval == Some(offered_interval) && our_timeout == Some(offered_timeout) {
            return Ok(());
        }

        let interval = self.next_value(
            "debit note interval",
            offered_interval,
            our_interval,
            self.config.min_debit_note_interval.as_secs(),
            self.config.requested_debit_note_interval.as_secs(),
        )?;
        let timeout = self.next_value(
            "payment timeout",
            offered_timeout,
            our_timeout,
            self.config.min_payment_timeout.as_secs(),
            self.config.requested_payment_timeout.as_secs(),
        )?;

        tracing::debug!(
            target: "reqlet::negotiation",
            proposal_id = %offer.proposal_id,
            debit_note_interval = interval,
            payment_timeout = timeout,
            "Mid-agreement payment terms"
        );
        demand
            .properties
            .insert(DEBIT_NOTE_INTERVAL.to_string(), Value::from(interval));
        demand
            .properties
            .insert(PAYMENT_TIMEOUT.to_string(), Value::from(timeout));
        Ok(())
    }
}
