use async_trait::async_trait;
use rand::Rng;

use super::Scorer;
use crate::resource::ProposalData;

/// Uniform random score in `[0, 1)`, useful as a low-weight tiebreaker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomScore;

#[async_trait]
impl Scorer for RandomScore {
    async fn score(&self, proposals: &[ProposalData]) -> Vec<Option<f64>> {
        random_scores(proposals.len())
    }
}

fn random_scores(count: usize) -> Vec<Option<f64>> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| Some(rng.r#gen::<f64>())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Properties;
    use crate::testing::proposal_data;

    #[tokio::test]
    async fn one_score_per_proposal_in_unit_range() {
        let data: Vec<ProposalData> = (0..20)
            .map(|i: u32| proposal_data(&format!("p{i}"), Properties::new()))
            .collect();
        let scores = RandomScore.score(&data).await;
        assert_eq!(scores.len(), 20);
        assert!(scores
            .iter()
            .all(|score| matches!(score, Some(value) if (0.0..1.0).contains(value))));
    }
}
