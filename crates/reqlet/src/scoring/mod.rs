//! Weighted multi-criteria ranking of proposals.
//!
//! Every [`Scorer`] rates a whole batch at once and may mark individual
//! proposals as inapplicable (`None`). A proposal's combined score is the
//! weighted average of the applicable scores, or 0 when none apply.

mod lerp;
mod map;
mod pricing;
mod random;

use std::sync::Arc;

use async_trait::async_trait;

use crate::resource::{Proposal, ProposalData};

pub use lerp::PropertyValueLerpScore;
pub use map::MapScore;
pub use pricing::{
    Coeff, LinearAverageCostPricing, LinearCoeffs, LinearCoeffsCost, LinearPerCpuAverageCostPricing,
    LinearPerCpuCoeffsCost, Pricing,
};
pub use random::RandomScore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoringError {
    #[error("One of `minus_one_at`, `zero_at` must be provided")]
    MissingLowerBound,
    #[error("One of `zero_at`, `one_at` must be provided")]
    MissingUpperBound,
    #[error("Boundary values must differ")]
    DegenerateBounds,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// One entry per proposal, `None` where the scorer does not apply.
    async fn score(&self, proposals: &[ProposalData]) -> Vec<Option<f64>>;
}

pub type WeightedScorer = (f64, Arc<dyn Scorer>);

/// Runs a list of weighted scorers and ranks proposals by the combined score.
#[derive(Clone, Default)]
pub struct ProposalScorer {
    scorers: Vec<WeightedScorer>,
}

impl ProposalScorer {
    pub fn new(scorers: Vec<WeightedScorer>) -> Self {
        Self { scorers }
    }

    pub fn with_scorer(mut self, weight: f64, scorer: Arc<dyn Scorer>) -> Self {
        self.scorers.push((weight, scorer));
        self
    }

    /// Combined score per proposal, in input order.
    pub async fn combined_scores(&self, proposals: &[ProposalData]) -> Vec<f64> {
        let mut per_scorer = Vec::with_capacity(self.scorers.len());
        for (weight, scorer) in &self.scorers {
            let scores = scorer.score(proposals).await;
            if scores.len() != proposals.len() {
                debug_assert!(false, "scorer returned {} scores for {} proposals", scores.len(), proposals.len());
                tracing::error!(
                    target: "reqlet::scoring",
                    expected = proposals.len(),
                    got = scores.len(),
                    "Scorer returned a wrong number of scores, ignoring it"
                );
                continue;
            }
            per_scorer.push((*weight, scores));
        }

        (0..proposals.len())
            .map(|index| {
                weighted_average(
                    per_scorer
                        .iter()
                        .filter_map(|(weight, scores)| scores[index].map(|score| (*weight, score))),
                )
            })
            .collect()
    }

    /// Proposals paired with their score, best first. Ties keep input order.
    pub async fn rank(&self, proposals: Vec<Proposal>) -> Vec<(f64, Proposal)> {
        let data: Vec<ProposalData> = proposals.iter().map(|proposal| proposal.data()).collect();
        let scores = self.combined_scores(&data).await;
        let mut scored: Vec<(f64, Proposal)> = scores.into_iter().zip(proposals).collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        tracing::debug!(
            target: "reqlet::scoring",
            proposals = scored.len(),
            best = scored.first().map(|(score, _)| *score),
            "Proposals ranked"
        );
        scored
    }
}

fn weighted_average(weighted: impl Iterator<Item = (f64, f64)>) -> f64 {
    let (weighted_sum, weights_sum) = weighted.fold((0.0, 0.0), |(sum, weights), (weight, score)| {
        (sum + weight * score, weights + weight)
    });
    if weights_sum == 0.0 {
        0.0
    } else {
        weighted_sum / weights_sum
    }
}

impl std::fmt::Debug for ProposalScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalScorer")
            .field("scorers", &self.scorers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{
        INF_CPU_THREADS, INF_MEM_GIB, PRICING_LINEAR_COEFFS, PRICING_MODEL, Properties,
    };
    use crate::testing::proposal_data;
    use serde_json::json;
    use std::time::Duration;

    fn lerp_mem() -> Arc<dyn Scorer> {
        Arc::new(PropertyValueLerpScore::new(INF_MEM_GIB, None, Some(1.0), Some(5.0)).unwrap())
    }

    fn flipped_cost() -> Arc<dyn Scorer> {
        Arc::new(
            MapScore::new(Arc::new(LinearAverageCostPricing::new(
                1.0,
                Duration::from_secs(60),
            )))
            .with_normalize(true)
            .with_normalize_flip(true),
        )
    }

    fn linear(coeffs: [f64; 3]) -> Properties {
        let mut properties = Properties::new();
        properties.insert(PRICING_MODEL.into(), json!("linear"));
        properties.insert(PRICING_LINEAR_COEFFS.into(), json!(coeffs));
        properties
    }

    async fn ranked_scores(scorer: &ProposalScorer, properties: Vec<Properties>) -> Vec<f64> {
        let data: Vec<ProposalData> = properties
            .into_iter()
            .enumerate()
            .map(|(i, props)| proposal_data(&format!("p{i}"), props))
            .collect();
        let mut scores = scorer.combined_scores(&data).await;
        scores.sort_by(|a, b| b.total_cmp(a));
        scores
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
        }
    }

    #[tokio::test]
    async fn no_scorers_scores_zero() {
        let scores = ranked_scores(&ProposalScorer::default(), vec![Properties::new(); 5]).await;
        assert_eq!(scores, vec![0.0; 5]);
    }

    #[tokio::test]
    async fn lerp_over_memory() {
        let scorer = ProposalScorer::default().with_scorer(0.5, lerp_mem());
        let properties = (0..7)
            .map(|gib: u32| {
                let mut props = Properties::new();
                props.insert(INF_MEM_GIB.into(), json!(gib));
                props
            })
            .collect();
        assert_close(
            &ranked_scores(&scorer, properties).await,
            &[1.0, 1.0, 0.75, 0.5, 0.25, 0.0, 0.0],
        );
    }

    #[tokio::test]
    async fn cheapest_ranks_first() {
        let scorer = ProposalScorer::default().with_scorer(1.0, flipped_cost());
        let data: Vec<ProposalData> = [[5e-5, 1e-4, 0.0], [5e-5, 3e-4, 0.0], [5e-5, 2e-4, 0.0]]
            .into_iter()
            .enumerate()
            .map(|(i, coeffs)| proposal_data(&format!("p{i}"), linear(coeffs)))
            .collect();

        assert_close(&scorer.combined_scores(&data).await, &[1.0, 0.0, 0.5]);
        assert_close(
            &ranked_scores(&scorer, data.into_iter().map(|d| d.properties).collect()).await,
            &[1.0, 0.5, 0.0],
        );
    }

    #[tokio::test]
    async fn weights_combine_scorers() {
        let scorer = ProposalScorer::new(vec![(1.0, lerp_mem()), (1.0, flipped_cost())]);
        let properties = [(4, [5e-5, 1e-4, 0.0]), (3, [5e-5, 3e-4, 0.0]), (2, [5e-5, 2e-4, 0.0])]
            .into_iter()
            .map(|(gib, coeffs): (u32, [f64; 3])| {
                let mut props = linear(coeffs);
                props.insert(INF_MEM_GIB.into(), json!(gib));
                props
            })
            .collect();
        assert_close(&ranked_scores(&scorer, properties).await, &[0.875, 0.375, 0.25]);
    }

    #[tokio::test]
    async fn inapplicable_scores_are_left_out_of_the_average() {
        let threads: Arc<dyn Scorer> = Arc::new(
            PropertyValueLerpScore::new(INF_CPU_THREADS, None, Some(0.0), Some(4.0)).unwrap(),
        );
        let scorer = ProposalScorer::new(vec![(1.0, lerp_mem()), (3.0, threads)]);

        let mut first = Properties::new();
        first.insert(INF_MEM_GIB.into(), json!(3));
        let mut second = Properties::new();
        second.insert(INF_MEM_GIB.into(), json!(5));
        second.insert(INF_CPU_THREADS.into(), json!(2));

        let data = vec![proposal_data("a", first), proposal_data("b", second)];
        assert_close(&scorer.combined_scores(&data).await, &[0.5, 0.625]);
    }

    #[tokio::test]
    async fn rank_is_stable_and_descending() {
        let market = crate::testing::FakeMarket::new(crate::session::Session::new());
        let proposals: Vec<Proposal> = ["a", "b", "c"]
            .into_iter()
            .map(|id| market.proposal(id, "provider"))
            .collect();

        let ranked = ProposalScorer::default().rank(proposals).await;
        let ids: Vec<String> = ranked.iter().map(|(_, p)| p.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
