use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use super::{Negotiator, RejectProposal};
use crate::resource::{CHOSEN_PAYMENT_PLATFORM, DemandData, PAYMENT_PLATFORM_PREFIX, ProposalData, Properties};

/// Platform names advertised as `golem.com.payment.platform.<name>.*`.
fn platforms(properties: &Properties) -> BTreeSet<String> {
    properties
        .keys()
        .filter_map(|key| key.strip_prefix(PAYMENT_PLATFORM_PREFIX))
        .filter_map(|rest| rest.split('.').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Picks the payment platform both sides support and writes it into the demand.
///
/// When the demand advertises no platforms of its own, any platform the offer
/// lists is acceptable. A demand that already carries a chosen platform is
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct AddChosenPaymentPlatform {
    preferred: Option<String>,
}

impl AddChosenPaymentPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept offers supporting `platform`.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.preferred = Some(platform.into());
        self
    }
}

#[async_trait]
impl Negotiator for AddChosenPaymentPlatform {
    async fn negotiate(
        &self,
        demand: &mut DemandData,
        offer: &ProposalData,
    ) -> Result<(), RejectProposal> {
        if demand.properties.contains_key(CHOSEN_PAYMENT_PLATFORM) {
            return Ok(());
        }

        let offered = platforms(&offer.properties);
        let ours = platforms(&demand.properties);
        let mut common: BTreeSet<String> = if ours.is_empty() {
            offered
        } else {
            offered.intersection(&ours).cloned().collect()
        };
        if let Some(preferred) = &self.preferred {
            common.retain(|name| name == preferred);
        }

        let Some(chosen) = common.into_iter().next() else {
            return Err(RejectProposal::new("No common payment platform!"));
        };
        tracing::debug!(target: "reqlet::negotiation", proposal_id = %offer.proposal_id, platform = %chosen, "Chose payment platform");
        demand
            .properties
            .insert(CHOSEN_PAYMENT_PLATFORM.to_string(), Value::String(chosen));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::proposal_data;
    use serde_json::json;

    fn properties(keys: &[&str]) -> Properties {
        keys.iter()
            .map(|key| (key.to_string(), json!("0xabc")))
            .collect()
    }

    #[tokio::test]
    async fn picks_first_common_platform() {
        let mut demand = DemandData::new(
            properties(&[
                "golem.com.payment.platform.erc20-polygon-glm.address",
                "golem.com.payment.platform.erc20-holesky-tglm.address",
            ]),
            Vec::new(),
        );
        let offer = proposal_data(
            "p1",
            properties(&[
                "golem.com.payment.platform.erc20-holesky-tglm.address",
                "golem.com.payment.platform.zksync-mainnet-glm.address",
            ]),
        );

        AddChosenPaymentPlatform::new()
            .negotiate(&mut demand, &offer)
            .await
            .unwrap();
        assert_eq!(
            demand.properties.get(CHOSEN_PAYMENT_PLATFORM),
            Some(&json!("erc20-holesky-tglm"))
        );
    }

    #[tokio::test]
    async fn rejects_without_common_platform() {
        let mut demand = DemandData::new(
            properties(&["golem.com.payment.platform.erc20-polygon-glm.address"]),
            Vec::new(),
        );
        let offer = proposal_data(
            "p1",
            properties(&["golem.com.payment.platform.erc20-holesky-tglm.address"]),
        );

        let result = AddChosenPaymentPlatform::new()
            .negotiate(&mut demand, &offer)
            .await;
        assert_eq!(result, Err(RejectProposal::new("No common payment platform!")));
        assert!(!demand.properties.contains_key(CHOSEN_PAYMENT_PLATFORM));
    }

    #[tokio::test]
    async fn preferred_platform_and_existing_choice() {
        let offer = proposal_data(
            "p1",
            properties(&[
                "golem.com.payment.platform.a.address",
                "golem.com.payment.platform.b.address",
            ]),
        );

        let mut demand = DemandData::default();
        AddChosenPaymentPlatform::new()
            .with_platform("b")
            .negotiate(&mut demand, &offer)
            .await
            .unwrap();
        assert_eq!(demand.properties.get(CHOSEN_PAYMENT_PLATFORM), Some(&json!("b")));

        let before = demand.clone();
        AddChosenPaymentPlatform::new()
            .negotiate(&mut demand, &offer)
            .await
            .unwrap();
        assert_eq!(demand, before);
    }
}
