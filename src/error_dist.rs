use tracing::{info, warn};

use crate::db::Database;
use crate::domain::City;

/// Source whose forecasts are compared against settlements for the
/// historical error distribution.
pub const CANONICAL_SOURCE: &str = "NWS";

/// Minimum historical (forecast, actual) pairs before the sample standard
/// deviation is trusted over the fallback table.
pub const MIN_SAMPLES: usize = 30;

/// Used when a fallback lookup cannot be resolved.
pub const GLOBAL_DEFAULT_STD_F: f64 = 2.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    /// Meteorological seasons: Dec-Jan-Feb is winter, and so on.
    pub fn from_month(month: u32) -> Season {
        match month {
            12 | 1 | 2 => Season::Winter,
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            _ => Season::Fall,
        }
    }

    pub fn months(&self) -> [u32; 3] {
        match self {
            Season::Winter => [12, 1, 2],
            Season::Spring => [3, 4, 5],
            Season::Summer => [6, 7, 8],
            Season::Fall => [9, 10, 11],
        }
    }
}

/// Conservative per-(city, season) error estimates used until enough
/// history accumulates. Degrees Fahrenheit.
pub fn fallback_error_std(city: City, season: Season) -> f64 {
    use City::*;
    use Season::*;
    match (city, season) {
        (Nyc, Winter) => 3.0,
        (Nyc, Spring) => 2.5,
        (Nyc, Summer) => 1.8,
        (Nyc, Fall) => 2.3,
        (Chi, Winter) => 3.5,
        (Chi, Spring) => 3.0,
        (Chi, Summer) => 2.0,
        (Chi, Fall) => 2.5,
        (Mia, Winter) => 1.5,
        (Mia, Spring) => 1.8,
        (Mia, Summer) => 2.0,
        (Mia, Fall) => 1.8,
        (Aus, Winter) => 2.5,
        (Aus, Spring) => 2.8,
        (Aus, Summer) => 2.0,
        (Aus, Fall) => 2.3,
    }
}

/// Sample standard deviation (ddof = 1). Returns None for fewer than two
/// values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

/// Historical forecast error standard deviation for a city and month.
///
/// Joins past canonical-source forecasts against settled actuals for the
/// same season. With at least MIN_SAMPLES pairs, the sample standard
/// deviation of (actual - forecast) is used; otherwise the fallback table.
/// The result is always strictly positive.
pub fn calculate_error_std(db: &Database, city: City, month: u32) -> f64 {
    let season = Season::from_month(month);

    match db.get_forecast_errors(city, CANONICAL_SOURCE, &season.months()) {
        Ok(errors) if errors.len() >= MIN_SAMPLES => {
            match sample_std(&errors) {
                Some(std) if std > 0.0 => {
                    info!(
                        city = %city,
                        season = ?season,
                        std_f = format!("{:.2}", std),
                        sample_count = errors.len(),
                        "Calculated historical error std"
                    );
                    return std;
                }
                // Degenerate history (all identical errors) is not usable.
                _ => {}
            }
        }
        Ok(errors) => {
            info!(
                city = %city,
                season = ?season,
                sample_count = errors.len(),
                min_required = MIN_SAMPLES,
                "Insufficient historical data for error std"
            );
        }
        Err(e) => {
            warn!(city = %city, season = ?season, error = %e, "Error querying historical data, using fallback");
        }
    }

    let fallback = fallback_error_std(city, season);
    info!(
        city = %city,
        season = ?season,
        std_f = fallback,
        "Using fallback error std"
    );
    fallback
}
