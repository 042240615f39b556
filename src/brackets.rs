use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::errors::{TradingError, TradingResult};

/// A bracket definition from exchange market data. Edge brackets have one
/// missing bound: no lower bound = bottom catch-all, no upper = top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketDef {
    pub label: String,
    pub lower_bound_f: Option<f64>,
    pub upper_bound_f: Option<f64>,
}

/// Probability that the actual high lands in one bracket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketProbability {
    pub bracket_label: String,
    pub lower_bound_f: Option<f64>,
    pub upper_bound_f: Option<f64>,
    pub probability: f64,
}

/// Calculate the probability of the temperature landing in each bracket.
///
/// Uses a normal distribution centered on the ensemble forecast with the
/// historical error standard deviation:
///   - bottom bracket: P = CDF(upper)
///   - top bracket:    P = 1 - CDF(lower)
///   - middle bracket: P = CDF(upper) - CDF(lower)
/// Each probability is clamped into [0, 1] and the set is renormalized to
/// sum to exactly 1.0, absorbing floating-point drift.
pub fn calculate_bracket_probabilities(
    ensemble_forecast_f: f64,
    error_std_f: f64,
    brackets: &[BracketDef],
) -> TradingResult<Vec<BracketProbability>> {
    if error_std_f <= 0.0 {
        return Err(TradingError::input(format!(
            "error_std_f must be positive, got {}",
            error_std_f
        )));
    }
    if brackets.is_empty() {
        return Err(TradingError::input("brackets list is empty"));
    }

    let dist = Normal::new(ensemble_forecast_f, error_std_f)
        .map_err(|e| TradingError::input(format!("invalid normal distribution: {}", e)))?;

    let mut results: Vec<BracketProbability> = brackets
        .iter()
        .map(|bracket| {
            let prob = match (bracket.lower_bound_f, bracket.upper_bound_f) {
                (None, Some(upper)) => dist.cdf(upper),
                (Some(lower), None) => 1.0 - dist.cdf(lower),
                (Some(lower), Some(upper)) => dist.cdf(upper) - dist.cdf(lower),
                (None, None) => 0.0,
            };
            BracketProbability {
                bracket_label: bracket.label.clone(),
                lower_bound_f: bracket.lower_bound_f,
                upper_bound_f: bracket.upper_bound_f,
                probability: prob.clamp(0.0, 1.0),
            }
        })
        .collect();

    let total: f64 = results.iter().map(|r| r.probability).sum();
    if total > 0.0 {
        for r in &mut results {
            r.probability /= total;
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn six_brackets() -> Vec<BracketDef> {
        vec![
            BracketDef {
                label: "<=50F".into(),
                lower_bound_f: None,
                upper_bound_f: Some(51.0),
            },
            BracketDef {
                label: "51-52F".into(),
                lower_bound_f: Some(51.0),
                upper_bound_f: Some(53.0),
            },
            BracketDef {
                label: "53-54F".into(),
                lower_bound_f: Some(53.0),
                upper_bound_f: Some(55.0),
            },
            BracketDef {
                label: "55-56F".into(),
                lower_bound_f: Some(55.0),
                upper_bound_f: Some(57.0),
            },
            BracketDef {
                label: "57-58F".into(),
                lower_bound_f: Some(57.0),
                upper_bound_f: Some(59.0),
            },
            BracketDef {
                label: ">=59F".into(),
                lower_bound_f: Some(59.0),
                upper_bound_f: None,
            },
        ]
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let probs = calculate_bracket_probabilities(54.2, 2.5, &six_brackets()).unwrap();
        assert_eq!(probs.len(), 6);
        let total: f64 = probs.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-6, "total={}", total);
        for p in &probs {
            assert!((0.0..=1.0).contains(&p.probability));
        }
    }

    #[test]
    fn test_middle_bracket_near_mean_dominates() {
        // mean 54.2, sigma 2.5: the 53-55 bracket should land around 0.35
        let probs = calculate_bracket_probabilities(54.2, 2.5, &six_brackets()).unwrap();
        let middle = probs.iter().find(|p| p.bracket_label == "53-54F").unwrap();
        assert!(
            (middle.probability - 0.35).abs() < 0.05,
            "got {}",
            middle.probability
        );
        // And it is the single most likely bracket.
        let max = probs
            .iter()
            .map(|p| p.probability)
            .fold(f64::MIN, f64::max);
        assert!((middle.probability - max).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mean_far_below_range_loads_bottom_bracket() {
        let probs = calculate_bracket_probabilities(40.0, 2.0, &six_brackets()).unwrap();
        assert!(probs[0].probability > 0.99);
    }

    #[test]
    fn test_mean_far_above_range_loads_top_bracket() {
        let probs = calculate_bracket_probabilities(70.0, 2.0, &six_brackets()).unwrap();
        assert!(probs[5].probability > 0.99);
    }

    #[test]
    fn test_labels_preserved_in_order() {
        let defs = six_brackets();
        let probs = calculate_bracket_probabilities(54.0, 2.5, &defs).unwrap();
        for (def, prob) in defs.iter().zip(&probs) {
            assert_eq!(def.label, prob.bracket_label);
        }
    }

    #[test]
    fn test_zero_sigma_rejected() {
        let err = calculate_bracket_probabilities(54.0, 0.0, &six_brackets()).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(calculate_bracket_probabilities(54.0, -1.0, &six_brackets()).is_err());
    }

    #[test]
    fn test_empty_brackets_rejected() {
        assert!(calculate_bracket_probabilities(54.0, 2.5, &[]).is_err());
    }

    #[test]
    fn test_unbounded_bracket_gets_zero() {
        let defs = vec![
            BracketDef {
                label: "broken".into(),
                lower_bound_f: None,
                upper_bound_f: None,
            },
            BracketDef {
                label: ">=0F".into(),
                lower_bound_f: Some(0.0),
                upper_bound_f: None,
            },
        ];
        let probs = calculate_bracket_probabilities(54.0, 2.5, &defs).unwrap();
        assert_eq!(probs[0].probability, 0.0);
        assert!((probs[1].probability - 1.0).abs() < 1e-9);
    }
}
