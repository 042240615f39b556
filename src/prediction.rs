use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::brackets::{calculate_bracket_probabilities, BracketDef, BracketProbability};
use crate::db::Database;
use crate::domain::{City, Confidence, WeatherObservation};
use crate::ensemble::{assess_confidence, calculate_ensemble_forecast};
use crate::error_dist::calculate_error_std;
use crate::errors::TradingResult;

/// Merged multi-source prediction for one (city, date). Immutable after
/// emission; consumed by the scanner and retained for calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub city: City,
    pub date: NaiveDate,
    /// Always 6 brackets in live use, probabilities summing to 1.
    pub brackets: Vec<BracketProbability>,
    pub ensemble_mean_f: f64,
    pub ensemble_std_f: f64,
    pub confidence: Confidence,
    pub model_sources: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// A trained regression model consumed as a black box. Implementations
/// live outside this crate; failures are non-fatal for prediction.
pub trait BlendModel: Send + Sync {
    fn predict_high_f(
        &self,
        city: City,
        date: NaiveDate,
        ensemble_mean_f: f64,
        forecast_spread_f: f64,
    ) -> TradingResult<f64>;
}

/// Blend the ensemble mean with a learned model's prediction.
///
/// With blend weight w: mean = (1 - w) * ensemble + w * model. A model
/// failure falls back to the pure ensemble mean.
pub fn blend_forecast(
    ensemble_mean_f: f64,
    spread_f: f64,
    city: City,
    date: NaiveDate,
    model: Option<&dyn BlendModel>,
    blend_weight: f64,
) -> f64 {
    let Some(model) = model else {
        return ensemble_mean_f;
    };
    if blend_weight <= 0.0 {
        return ensemble_mean_f;
    }

    match model.predict_high_f(city, date, ensemble_mean_f, spread_f) {
        Ok(model_mean) => {
            let blended = (1.0 - blend_weight) * ensemble_mean_f + blend_weight * model_mean;
            info!(
                city = %city,
                ensemble_f = format!("{:.1}", ensemble_mean_f),
                model_f = format!("{:.1}", model_mean),
                blended_f = format!("{:.1}", blended),
                "Blended forecast with learned model"
            );
            blended
        }
        Err(e) => {
            warn!(city = %city, error = %e, "Learned blend failed, using pure ensemble");
            ensemble_mean_f
        }
    }
}

/// Run the full prediction pipeline for one city and date:
/// weighted ensemble, historical error sigma, optional learned blend,
/// bracket CDF, and confidence assessment.
#[allow(clippy::too_many_arguments)]
pub fn generate_prediction(
    db: &Database,
    city: City,
    target_date: NaiveDate,
    forecasts: &[WeatherObservation],
    bracket_defs: &[BracketDef],
    blend_model: Option<&dyn BlendModel>,
    blend_weight: f64,
    now: DateTime<Utc>,
) -> TradingResult<EnsemblePrediction> {
    let (ensemble_temp, spread, sources) = calculate_ensemble_forecast(forecasts, None)?;

    let error_std = calculate_error_std(db, city, target_date.month());

    let final_mean = blend_forecast(
        ensemble_temp,
        spread,
        city,
        target_date,
        blend_model,
        blend_weight,
    );

    let bracket_probs = calculate_bracket_probabilities(final_mean, error_std, bracket_defs)?;

    let oldest_fetch = forecasts
        .iter()
        .map(|fc| fc.fetched_at)
        .min()
        .unwrap_or(now);
    let data_age_minutes = (now - oldest_fetch).num_seconds() as f64 / 60.0;

    let confidence = assess_confidence(spread, error_std, sources.len(), data_age_minutes);

    let prediction = EnsemblePrediction {
        city,
        date: target_date,
        brackets: bracket_probs,
        ensemble_mean_f: (final_mean * 100.0).round() / 100.0,
        ensemble_std_f: (error_std * 100.0).round() / 100.0,
        confidence,
        model_sources: sources,
        generated_at: now,
    };

    info!(
        city = %city,
        date = %target_date,
        ensemble_mean_f = prediction.ensemble_mean_f,
        ensemble_std_f = prediction.ensemble_std_f,
        confidence = %confidence,
        bracket_count = prediction.brackets.len(),
        "Prediction generated"
    );

    Ok(prediction)
}
