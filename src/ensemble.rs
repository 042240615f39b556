use std::collections::HashMap;

use tracing::info;

use crate::domain::{Confidence, WeatherObservation};
use crate::errors::{TradingError, TradingResult};

/// Weight applied to sources not in the recognized set.
pub const UNKNOWN_SOURCE_WEIGHT: f64 = 0.05;

/// Fixed per-source weights. ECMWF is the strongest global model and NWS
/// forecasts feed the settlement source, so both carry most of the mass.
pub const DEFAULT_MODEL_WEIGHTS: [(&str, f64); 5] = [
    ("NWS", 0.35),
    ("Open-Meteo:ECMWF", 0.30),
    ("Open-Meteo:GFS", 0.20),
    ("Open-Meteo:ICON", 0.10),
    ("Open-Meteo:GEM", 0.05),
];

pub fn source_weight(source: &str, overrides: Option<&HashMap<String, f64>>) -> f64 {
    if let Some(map) = overrides {
        return map.get(source).copied().unwrap_or(UNKNOWN_SOURCE_WEIGHT);
    }
    DEFAULT_MODEL_WEIGHTS
        .iter()
        .find(|(name, _)| *name == source)
        .map(|(_, w)| *w)
        .unwrap_or(UNKNOWN_SOURCE_WEIGHT)
}

/// Weighted ensemble over one (city, date)'s observations.
///
/// Returns (ensemble_temp_f, spread_f, contributing source names). The
/// spread is plain max - min across sources, not weighted.
pub fn calculate_ensemble_forecast(
    forecasts: &[WeatherObservation],
    weights: Option<&HashMap<String, f64>>,
) -> TradingResult<(f64, f64, Vec<String>)> {
    if forecasts.is_empty() {
        return Err(TradingError::input(
            "no forecasts provided for ensemble calculation",
        ));
    }

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut temps = Vec::with_capacity(forecasts.len());
    let mut sources = Vec::with_capacity(forecasts.len());

    for fc in forecasts {
        let w = source_weight(&fc.source, weights);
        weighted_sum += fc.forecast_high_f * w;
        weight_total += w;
        temps.push(fc.forecast_high_f);
        sources.push(fc.source.clone());
    }

    if weight_total == 0.0 {
        return Err(TradingError::input("all ensemble weights are zero"));
    }

    let ensemble_temp = weighted_sum / weight_total;
    let max = temps.iter().copied().fold(f64::MIN, f64::max);
    let min = temps.iter().copied().fold(f64::MAX, f64::min);
    let spread = max - min;

    info!(
        ensemble_f = format!("{:.1}", ensemble_temp),
        spread_f = format!("{:.1}", spread),
        sources = ?sources,
        "Ensemble calculated"
    );

    Ok((ensemble_temp, spread, sources))
}

/// Integer-scored confidence assessment.
///
/// Model agreement weighs most, then historical accuracy, source count,
/// and freshness:
///   spread <= 1F +3, <= 2F +2, <= 3F +1
///   sigma  <= 2F +2, <= 3F +1
///   sources >= 4 +1
///   age <= 60 min +1, > 120 min -1
/// Score >= 5 is high, 3-4 medium, otherwise low.
pub fn assess_confidence(
    forecast_spread_f: f64,
    error_std_f: f64,
    num_sources: usize,
    data_age_minutes: f64,
) -> Confidence {
    let mut score = 0i32;

    if forecast_spread_f <= 1.0 {
        score += 3;
    } else if forecast_spread_f <= 2.0 {
        score += 2;
    } else if forecast_spread_f <= 3.0 {
        score += 1;
    }

    if error_std_f <= 2.0 {
        score += 2;
    } else if error_std_f <= 3.0 {
        score += 1;
    }

    if num_sources >= 4 {
        score += 1;
    }

    if data_age_minutes <= 60.0 {
        score += 1;
    } else if data_age_minutes > 120.0 {
        score -= 1;
    }

    if score >= 5 {
        Confidence::High
    } else if score >= 3 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::City;
    use chrono::{NaiveDate, Utc};

    fn obs(source: &str, high: f64) -> WeatherObservation {
        WeatherObservation {
            source: source.to_string(),
            city: City::Nyc,
            date: NaiveDate::from_ymd_opt(2026, 2, 18).unwrap(),
            forecast_high_f: high,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_weighted_mean_favors_heavier_sources() {
        // NWS 0.35 @ 50, GEM 0.05 @ 60 -> (17.5 + 3.0) / 0.40 = 51.25
        let forecasts = vec![obs("NWS", 50.0), obs("Open-Meteo:GEM", 60.0)];
        let (mean, spread, sources) = calculate_ensemble_forecast(&forecasts, None).unwrap();
        assert!((mean - 51.25).abs() < 1e-9, "mean={}", mean);
        assert!((spread - 10.0).abs() < f64::EPSILON);
        assert_eq!(sources, vec!["NWS", "Open-Meteo:GEM"]);
    }

    #[test]
    fn test_unknown_source_gets_default_weight() {
        assert_eq!(source_weight("SomeNewModel", None), UNKNOWN_SOURCE_WEIGHT);
        assert_eq!(source_weight("NWS", None), 0.35);
    }

    #[test]
    fn test_weight_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("NWS".to_string(), 1.0);
        assert_eq!(source_weight("NWS", Some(&overrides)), 1.0);
        assert_eq!(
            source_weight("Open-Meteo:GFS", Some(&overrides)),
            UNKNOWN_SOURCE_WEIGHT
        );
    }

    #[test]
    fn test_spread_is_unweighted_max_minus_min() {
        let forecasts = vec![obs("NWS", 52.0), obs("Open-Meteo:GFS", 55.5), obs("X", 54.0)];
        let (_, spread, _) = calculate_ensemble_forecast(&forecasts, None).unwrap();
        assert!((spread - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input_fails() {
        let err = calculate_ensemble_forecast(&[], None).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_all_zero_weights_fail() {
        let mut overrides = HashMap::new();
        overrides.insert("NWS".to_string(), 0.0);
        // Unknown sources would get 0.05, so use a recognized one zeroed out.
        let forecasts = vec![obs("NWS", 50.0)];
        assert!(calculate_ensemble_forecast(&forecasts, Some(&overrides)).is_err());
    }

    #[test]
    fn test_confidence_high() {
        // spread 1.0 (+3), sigma 2.0 (+2), 4 sources (+1), fresh (+1) = 7
        assert_eq!(assess_confidence(1.0, 2.0, 4, 30.0), Confidence::High);
    }

    #[test]
    fn test_confidence_medium() {
        // spread 2.5 (+1), sigma 2.5 (+1), 3 sources (0), fresh (+1) = 3
        assert_eq!(assess_confidence(2.5, 2.5, 3, 30.0), Confidence::Medium);
    }

    #[test]
    fn test_confidence_low_with_stale_penalty() {
        // spread 4 (0), sigma 4 (0), 2 sources (0), stale (-1) = -1
        assert_eq!(assess_confidence(4.0, 4.0, 2, 180.0), Confidence::Low);
    }

    #[test]
    fn test_confidence_spread_boundaries() {
        // Exactly at each threshold
        assert_eq!(assess_confidence(1.0, 4.0, 1, 90.0), Confidence::Medium); // +3
        assert_eq!(assess_confidence(2.0, 4.0, 1, 90.0), Confidence::Low); // +2
        assert_eq!(assess_confidence(3.0, 4.0, 1, 90.0), Confidence::Low); // +1
    }
}
