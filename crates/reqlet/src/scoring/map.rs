use std::sync::Arc;

use async_trait::async_trait;

use super::{Pricing, Scorer};
use crate::resource::ProposalData;

/// Scores every proposal with a per-proposal function, optionally normalized
/// to `[0, 1]` across the batch and flipped so that lower values score higher.
pub struct MapScore {
    func: Arc<dyn Pricing>,
    normalize: bool,
    normalize_flip: bool,
}

impl MapScore {
    pub fn new(func: Arc<dyn Pricing>) -> Self {
        Self {
            func,
            normalize: false,
            normalize_flip: false,
        }
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_normalize_flip(mut self, normalize_flip: bool) -> Self {
        self.normalize_flip = normalize_flip;
        self
    }
}

#[async_trait]
impl Scorer for MapScore {
    async fn score(&self, proposals: &[ProposalData]) -> Vec<Option<f64>> {
        let values: Vec<Option<f64>> = proposals.iter().map(|data| self.func.price(data)).collect();
        if !self.normalize {
            return values;
        }

        let present = values.iter().flatten().copied();
        let (min, max) = present.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
            (min.min(value), max.max(value))
        });
        let range = max - min;
        // Nothing to spread: no applicable values or all equal.
        if !range.is_finite() || range == 0.0 {
            return values;
        }

        values
            .into_iter()
            .map(|value| {
                value.map(|value| {
                    let normalized = (value - min) / range;
                    if self.normalize_flip {
                        1.0 - normalized
                    } else {
                        normalized
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Properties;
    use crate::testing::proposal_data;
    use serde_json::json;

    fn weights(values: &[Option<f64>]) -> Vec<ProposalData> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let mut properties = Properties::new();
                if let Some(value) = value {
                    properties.insert("weight".into(), json!(value));
                }
                proposal_data(&format!("p{i}"), properties)
            })
            .collect()
    }

    fn weight_of() -> Arc<dyn Pricing> {
        Arc::new(|data: &ProposalData| data.property_f64("weight"))
    }

    #[tokio::test]
    async fn raw_values_without_normalization() {
        let data = weights(&[Some(2.0), None, Some(6.0)]);
        let scores = MapScore::new(weight_of()).score(&data).await;
        assert_eq!(scores, vec![Some(2.0), None, Some(6.0)]);
    }

    #[tokio::test]
    async fn normalized_and_flipped() {
        let data = weights(&[Some(2.0), None, Some(6.0), Some(4.0)]);

        let normalized = MapScore::new(weight_of()).with_normalize(true).score(&data).await;
        assert_eq!(normalized, vec![Some(0.0), None, Some(1.0), Some(0.5)]);

        let flipped = MapScore::new(weight_of())
            .with_normalize(true)
            .with_normalize_flip(true)
            .score(&data)
            .await;
        assert_eq!(flipped, vec![Some(1.0), None, Some(0.0), Some(0.5)]);
    }

    #[tokio::test]
    async fn equal_values_are_left_untouched() {
        let data = weights(&[Some(3.0), Some(3.0)]);
        let scores = MapScore::new(weight_of()).with_normalize(true).score(&data).await;
        assert_eq!(scores, vec![Some(3.0), Some(3.0)]);
    }
}
