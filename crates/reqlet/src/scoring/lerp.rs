use async_trait::async_trait;

use super::{Scorer, ScoringError};
use crate::resource::ProposalData;

/// Linear interpolation of a numeric property between two boundary points.
///
/// Values outside the boundaries are clamped. The lower boundary is
/// `(-1, minus_one_at)` when given, otherwise `(0, zero_at)`; the upper one is
/// `(1, one_at)` when given, otherwise `(0, zero_at)`.
#[derive(Debug, Clone)]
pub struct PropertyValueLerpScore {
    property: String,
    lower: (f64, f64),
    upper: (f64, f64),
}

impl PropertyValueLerpScore {
    pub fn new(
        property: impl Into<String>,
        minus_one_at: Option<f64>,
        zero_at: Option<f64>,
        one_at: Option<f64>,
    ) -> Result<Self, ScoringError> {
        let lower = match (minus_one_at, zero_at) {
            (Some(value), _) => (-1.0, value),
            (None, Some(value)) => (0.0, value),
            (None, None) => return Err(ScoringError::MissingLowerBound),
        };
        let upper = match (one_at, zero_at) {
            (Some(value), _) => (1.0, value),
            (None, Some(value)) => (0.0, value),
            (None, None) => return Err(ScoringError::MissingUpperBound),
        };
        if lower.1 == upper.1 {
            return Err(ScoringError::DegenerateBounds);
        }

        Ok(Self {
            property: property.into(),
            lower,
            upper,
        })
    }

    fn score_one(&self, data: &ProposalData) -> Option<f64> {
        let value = data.property_f64(&self.property)?;
        let (x1, y1) = self.lower;
        let (x2, y2) = self.upper;
        let clamped = value.clamp(y1.min(y2), y1.max(y2));
        Some(((y2 - clamped) * x1 + (clamped - y1) * x2) / (y2 - y1))
    }
}

#[async_trait]
impl Scorer for PropertyValueLerpScore {
    async fn score(&self, proposals: &[ProposalData]) -> Vec<Option<f64>> {
        proposals.iter().map(|data| self.score_one(data)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Properties;
    use crate::testing::proposal_data;
    use serde_json::json;

    fn with_value(value: serde_json::Value) -> ProposalData {
        let mut properties = Properties::new();
        properties.insert("golem.inf.storage.gib".into(), value);
        proposal_data("p", properties)
    }

    #[tokio::test]
    async fn minus_one_to_one_range() {
        let scorer =
            PropertyValueLerpScore::new("golem.inf.storage.gib", Some(0.0), None, Some(10.0)).unwrap();
        let data = vec![
            with_value(json!(-3)),
            with_value(json!(5)),
            with_value(json!(7.5)),
            with_value(json!(40)),
        ];
        assert_eq!(
            scorer.score(&data).await,
            vec![Some(-1.0), Some(0.0), Some(0.5), Some(1.0)]
        );
    }

    #[tokio::test]
    async fn reversed_boundaries_score_descending() {
        let scorer =
            PropertyValueLerpScore::new("golem.inf.storage.gib", None, Some(8.0), Some(0.0)).unwrap();
        let data = vec![with_value(json!(0)), with_value(json!(2)), with_value(json!(100))];
        assert_eq!(
            scorer.score(&data).await,
            vec![Some(1.0), Some(0.75), Some(0.0)]
        );
    }

    #[tokio::test]
    async fn missing_or_non_numeric_is_inapplicable() {
        let scorer =
            PropertyValueLerpScore::new("golem.inf.storage.gib", None, Some(0.0), Some(1.0)).unwrap();
        let data = vec![proposal_data("p", Properties::new()), with_value(json!("big"))];
        assert_eq!(scorer.score(&data).await, vec![None, None]);
    }

    #[test]
    fn boundaries_are_validated() {
        assert_eq!(
            PropertyValueLerpScore::new("x", None, None, Some(1.0)).unwrap_err(),
            ScoringError::MissingLowerBound
        );
        assert_eq!(
            PropertyValueLerpScore::new("x", Some(1.0), None, None).unwrap_err(),
            ScoringError::MissingUpperBound
        );
        assert_eq!(
            PropertyValueLerpScore::new("x", None, Some(1.0), None).unwrap_err(),
            ScoringError::DegenerateBounds
        );
    }
}
