use tracing::debug;

use crate::domain::{validate_price_cents, Side, KALSHI_FEE_RATE, MIN_FEE_CENTS};
use crate::errors::{TradingError, TradingResult};

/// Configuration for Kelly Criterion position sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct KellySettings {
    /// Disabled means every positive-EV signal gets exactly 1 contract.
    pub use_kelly_sizing: bool,
    /// Fractional multiplier on the raw Kelly fraction (0.25 = quarter).
    pub kelly_fraction: f64,
    /// Max share of bankroll a single trade may consume.
    pub max_bankroll_pct_per_trade: f64,
    /// Hard cap on contracts per trade.
    pub max_contracts_per_trade: i64,
}

impl Default for KellySettings {
    fn default() -> Self {
        KellySettings {
            use_kelly_sizing: false,
            kelly_fraction: 0.25,
            max_bankroll_pct_per_trade: 0.05,
            max_contracts_per_trade: 10,
        }
    }
}

/// Result of a Kelly calculation with full diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KellyResult {
    /// Uncapped Kelly fraction; negative means no edge.
    pub raw_kelly_fraction: f64,
    /// After the fractional multiplier.
    pub adjusted_kelly_fraction: f64,
    /// Final recommended contract count.
    pub optimal_quantity: i64,
    /// Total cost in cents at the recommended quantity.
    pub cost_cents: i64,
    /// Expected profit per contract in cents, fee-adjusted.
    pub edge_cents: f64,
    /// Why the quantity was adjusted, one entry per cap applied.
    pub reasons: Vec<String>,
}

/// Raw Kelly fraction for a binary contract, fee-adjusted.
///
/// With cost c, net profit-if-win b (after the exchange fee), and win
/// probability p: f* = (p * b - (1 - p) * c) / b. For the NO side the win
/// probability is 1 - model_prob and the cost is 100 - price.
pub fn calculate_kelly_fraction(
    model_prob: f64,
    price_cents: i64,
    side: Side,
) -> TradingResult<f64> {
    if !(0.0..=1.0).contains(&model_prob) {
        return Err(TradingError::input(format!(
            "model_prob must be 0.0-1.0, got {}",
            model_prob
        )));
    }
    validate_price_cents(price_cents)?;

    let (cost, profit_if_win, prob_win) = match side {
        Side::Yes => (price_cents, 100 - price_cents, model_prob),
        Side::No => (100 - price_cents, price_cents, 1.0 - model_prob),
    };

    let fee_if_win = ((profit_if_win as f64 * KALSHI_FEE_RATE) as i64).max(MIN_FEE_CENTS);
    let net_profit = profit_if_win - fee_if_win;

    if net_profit <= 0 {
        return Ok(0.0);
    }

    let q = 1.0 - prob_win;
    let kelly = (prob_win * net_profit as f64 - q * cost as f64) / net_profit as f64;
    Ok(kelly)
}

/// Optimal position size under fractional Kelly with five safety caps,
/// applied in priority order:
///   1. raw <= 0 -> 0 contracts
///   2. max_contracts_per_trade
///   3. max_bankroll_pct_per_trade
///   4. max_trade_size_cents
///   5. floor at 1 contract when the edge is positive
pub fn calculate_kelly_size(
    model_prob: f64,
    price_cents: i64,
    side: Side,
    bankroll_cents: i64,
    settings: &KellySettings,
    max_trade_size_cents: i64,
) -> TradingResult<KellyResult> {
    let mut result = KellyResult::default();

    let cost_per_contract = side.cost_cents(price_cents);

    if !settings.use_kelly_sizing {
        result.optimal_quantity = 1;
        result.cost_cents = cost_per_contract;
        result
            .reasons
            .push("Kelly sizing disabled — using 1 contract".to_string());
        return Ok(result);
    }

    let raw_kelly = calculate_kelly_fraction(model_prob, price_cents, side)?;
    result.raw_kelly_fraction = round6(raw_kelly);

    if raw_kelly <= 0.0 {
        result.optimal_quantity = 0;
        result
            .reasons
            .push(format!("Negative edge (Kelly={:.4}) — no bet", raw_kelly));
        return Ok(result);
    }

    let adjusted = raw_kelly * settings.kelly_fraction;
    result.adjusted_kelly_fraction = round6(adjusted);

    let optimal_bet_cents = adjusted * bankroll_cents as f64;

    // Expected fee-adjusted profit per contract in cents.
    let fee_cents = (((100 - cost_per_contract) as f64 * KALSHI_FEE_RATE) as i64).max(MIN_FEE_CENTS);
    let net_payout = (100 - fee_cents) as f64;
    let prob_win = match side {
        Side::Yes => model_prob,
        Side::No => 1.0 - model_prob,
    };
    result.edge_cents = round2(prob_win * net_payout - cost_per_contract as f64);

    if cost_per_contract <= 0 {
        result.optimal_quantity = 0;
        result.reasons.push("Zero cost per contract".to_string());
        return Ok(result);
    }

    let mut quantity = (optimal_bet_cents / cost_per_contract as f64) as i64;
    let mut reasons = Vec::new();

    if quantity > settings.max_contracts_per_trade {
        reasons.push(format!(
            "Capped from {} to {} (max_contracts_per_trade)",
            quantity, settings.max_contracts_per_trade
        ));
        quantity = settings.max_contracts_per_trade;
    }

    let max_from_bankroll =
        ((bankroll_cents as f64 * settings.max_bankroll_pct_per_trade) as i64) / cost_per_contract;
    if quantity > max_from_bankroll {
        reasons.push(format!(
            "Capped from {} to {} ({:.0}% bankroll cap)",
            quantity,
            max_from_bankroll,
            settings.max_bankroll_pct_per_trade * 100.0
        ));
        quantity = max_from_bankroll;
    }

    let max_from_risk = max_trade_size_cents / cost_per_contract;
    if quantity > max_from_risk {
        reasons.push(format!(
            "Capped from {} to {} (max_trade_size_cents={})",
            quantity, max_from_risk, max_trade_size_cents
        ));
        quantity = max_from_risk;
    }

    if quantity < 1 {
        quantity = 1;
        reasons.push("Floored to 1 contract (positive edge, small bankroll)".to_string());
    }

    result.optimal_quantity = quantity;
    result.cost_cents = quantity * cost_per_contract;
    result.reasons = reasons;

    debug!(
        raw_kelly = result.raw_kelly_fraction,
        adjusted_kelly = result.adjusted_kelly_fraction,
        quantity = result.optimal_quantity,
        cost_cents = result.cost_cents,
        edge_cents = result.edge_cents,
        "Kelly sizing calculated"
    );

    Ok(result)
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
