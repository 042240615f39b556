use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::domain::{estimate_fees, validate_price_cents, City, Confidence, Side};
use crate::errors::{TradingError, TradingResult};
use crate::kelly::{calculate_kelly_size, KellySettings};
use crate::prediction::EnsemblePrediction;

/// Predictions older than this are refused by the scanner.
pub const MAX_PREDICTION_AGE_HOURS: i64 = 2;

/// A candidate trade identified by the scanner. Transient: consumed by the
/// risk manager, then either executed, queued, or discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub city: City,
    pub bracket: String,
    pub side: Side,
    /// Market YES price in cents, regardless of side.
    pub price_cents: i64,
    pub quantity: i64,
    pub model_probability: f64,
    pub market_probability: f64,
    /// Expected value per contract in dollars.
    pub ev: f64,
    pub confidence: Confidence,
    pub market_ticker: String,
    pub reasoning: String,
}

impl TradeSignal {
    /// Total capital at risk for this signal, in cents.
    pub fn total_cost_cents(&self) -> i64 {
        self.quantity * self.side.cost_cents(self.price_cents)
    }
}

/// Bankroll-aware sizing inputs threaded into a scan when Kelly is on.
#[derive(Debug, Clone)]
pub struct SizingContext {
    pub settings: KellySettings,
    pub bankroll_cents: i64,
    pub max_trade_size_cents: i64,
}

/// Expected value for one side of a bracket, in dollars.
///
/// Fees are subtracted unconditionally, not only on wins. That overstates
/// the fee cost and understates EV, which is the safe direction: a marginal
/// trade missed beats a bad trade taken.
pub fn calculate_ev(model_prob: f64, market_price_cents: i64, side: Side) -> TradingResult<f64> {
    if !(0.0..=1.0).contains(&model_prob) {
        return Err(TradingError::input(format!(
            "model_prob must be 0.0-1.0, got {}",
            model_prob
        )));
    }
    validate_price_cents(market_price_cents)?;

    let (prob_win, cost_dollars) = match side {
        Side::Yes => (model_prob, market_price_cents as f64 / 100.0),
        Side::No => (1.0 - model_prob, (100 - market_price_cents) as f64 / 100.0),
    };

    let fee_dollars = estimate_fees(market_price_cents, side)? as f64 / 100.0;
    let ev = prob_win * 1.00 - cost_dollars - fee_dollars;
    Ok(round4(ev))
}

/// Scan one bracket on both sides; emit a signal for the better side when
/// it clears the EV threshold.
#[allow(clippy::too_many_arguments)]
pub fn scan_bracket(
    bracket_label: &str,
    bracket_probability: f64,
    market_price_cents: i64,
    min_ev_threshold: f64,
    city: City,
    confidence: Confidence,
    market_ticker: &str,
    sizing: Option<&SizingContext>,
) -> TradingResult<Option<TradeSignal>> {
    let ev_yes = calculate_ev(bracket_probability, market_price_cents, Side::Yes)?;
    let ev_no = calculate_ev(bracket_probability, market_price_cents, Side::No)?;

    debug!(
        city = %city,
        bracket = bracket_label,
        model_prob = round4(bracket_probability),
        market_cents = market_price_cents,
        ev_yes,
        ev_no,
        "Bracket scan"
    );

    let (best_side, best_ev) = if ev_yes >= ev_no && ev_yes >= min_ev_threshold {
        (Side::Yes, ev_yes)
    } else if ev_no > ev_yes && ev_no >= min_ev_threshold {
        (Side::No, ev_no)
    } else {
        return Ok(None);
    };

    let quantity = match sizing {
        Some(ctx) => {
            let kelly = calculate_kelly_size(
                bracket_probability,
                market_price_cents,
                best_side,
                ctx.bankroll_cents,
                &ctx.settings,
                ctx.max_trade_size_cents,
            )?;
            if kelly.optimal_quantity < 1 {
                return Ok(None);
            }
            kelly.optimal_quantity
        }
        None => 1,
    };

    let market_prob = match best_side {
        Side::Yes => market_price_cents as f64 / 100.0,
        Side::No => (100 - market_price_cents) as f64 / 100.0,
    };

    Ok(Some(TradeSignal {
        city,
        bracket: bracket_label.to_string(),
        side: best_side,
        price_cents: market_price_cents,
        quantity,
        model_probability: bracket_probability,
        market_probability: round4(market_prob),
        ev: best_ev,
        confidence,
        market_ticker: market_ticker.to_string(),
        reasoning: signal_reasoning(
            bracket_probability,
            market_price_cents,
            best_side,
            best_ev,
        ),
    }))
}

/// Scan all brackets of one prediction; brackets without a cached price or
/// ticker are skipped. Output is sorted by EV descending.
pub fn scan_all_brackets(
    prediction: &EnsemblePrediction,
    market_prices: &HashMap<String, i64>,
    market_tickers: &HashMap<String, String>,
    min_ev_threshold: f64,
    sizing: Option<&SizingContext>,
) -> Vec<TradeSignal> {
    let mut signals = Vec::new();

    for bracket in &prediction.brackets {
        let Some(&price) = market_prices.get(&bracket.bracket_label) else {
            warn!(
                city = %prediction.city,
                bracket = %bracket.bracket_label,
                "No market price for bracket"
            );
            continue;
        };
        let Some(ticker) = market_tickers.get(&bracket.bracket_label) else {
            warn!(
                city = %prediction.city,
                bracket = %bracket.bracket_label,
                "No market ticker for bracket"
            );
            continue;
        };

        match scan_bracket(
            &bracket.bracket_label,
            bracket.probability,
            price,
            min_ev_threshold,
            prediction.city,
            prediction.confidence,
            ticker,
            sizing,
        ) {
            Ok(Some(signal)) => signals.push(signal),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    city = %prediction.city,
                    bracket = %bracket.bracket_label,
                    error = %e,
                    "Bracket scan failed"
                );
            }
        }
    }

    signals.sort_by(|a, b| b.ev.partial_cmp(&a.ev).unwrap_or(std::cmp::Ordering::Equal));

    info!(
        city = %prediction.city,
        total_brackets = prediction.brackets.len(),
        signals_found = signals.len(),
        "Bracket scan complete"
    );
    signals
}

/// Gate predictions before trading on them. Returns true only when every
/// prediction passes all checks; any failure is logged and halts signal
/// generation for the cycle.
pub fn validate_predictions(predictions: &[EnsemblePrediction], now: DateTime<Utc>) -> bool {
    for pred in predictions {
        let total: f64 = pred.brackets.iter().map(|b| b.probability).sum();
        if !(0.95..=1.05).contains(&total) {
            error!(
                city = %pred.city,
                total = round4(total),
                "Bracket probabilities do not sum to 1.0"
            );
            return false;
        }

        for b in &pred.brackets {
            if b.probability.is_nan() || b.probability < 0.0 {
                error!(
                    city = %pred.city,
                    bracket = %b.bracket_label,
                    probability = b.probability,
                    "Invalid probability value"
                );
                return false;
            }
        }

        if pred.brackets.len() != 6 {
            error!(
                city = %pred.city,
                count = pred.brackets.len(),
                "Expected 6 brackets"
            );
            return false;
        }

        let age = now - pred.generated_at;
        if age > Duration::hours(MAX_PREDICTION_AGE_HOURS) {
            warn!(
                city = %pred.city,
                age_hours = format!("{:.2}", age.num_seconds() as f64 / 3600.0),
                "Stale predictions detected"
            );
            return false;
        }
    }
    true
}

/// Gate quoted prices: every price must be an integer in [1, 99].
pub fn validate_market_prices(prices: &HashMap<String, i64>) -> bool {
    for (label, &price) in prices {
        if !(1..=99).contains(&price) {
            error!(bracket = %label, price_cents = price, "Market price out of range");
            return false;
        }
    }
    true
}

fn signal_reasoning(bracket_prob: f64, market_price_cents: i64, side: Side, ev: f64) -> String {
    let model_pct = bracket_prob * 100.0;
    let market_pct = match side {
        Side::Yes => market_price_cents,
        Side::No => 100 - market_price_cents,
    };
    let edge = model_pct - market_pct as f64;
    format!(
        "Model: {:.1}% vs Market: {}% ({}{:.1}% edge). EV: ${:+.4} per contract on {} side.",
        model_pct,
        market_pct,
        if edge > 0.0 { "+" } else { "" },
        edge,
        ev,
        side.as_str().to_uppercase()
    )
}

fn round4(v: f64) -> f64 {
    (v * 1e4).round() / 1e4
}
