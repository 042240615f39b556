use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cooldown::CooldownManager;
use crate::config::UserSettings;
use crate::db::{Database, SettlementRow, TradeRow};
use crate::domain::{estimate_fees, BracketBounds, Side, TradeStatus, WeatherObservation};

/// Whether a bracket/side combination won given the observed temperature.
/// Long wins when the bracket hit; short wins when it missed.
pub fn did_bracket_win(bracket_label: &str, actual_temp_f: f64, side: Side) -> bool {
    let hit = match BracketBounds::parse(bracket_label) {
        Ok(bounds) => bounds.contains(actual_temp_f),
        Err(e) => {
            warn!(bracket_label, error = %e, "Failed to parse bracket label");
            false
        }
    };
    match side {
        Side::Yes => hit,
        Side::No => !hit,
    }
}

/// Cents-exact P&L for a settled trade: (pnl_cents, fees_cents).
///
/// cost = quantity * price (long) or quantity * (100 - price) (short).
/// WIN: payout quantity * 100, minus cost, minus the per-contract fee.
/// LOSS: -cost, no fee.
pub fn settlement_pnl(
    price_cents: i64,
    quantity: i64,
    side: Side,
    won: bool,
) -> Result<(i64, i64)> {
    let cost_cents = quantity * side.cost_cents(price_cents);
    if won {
        let payout_cents = 100 * quantity;
        let fee_cents = estimate_fees(price_cents, side)
            .map_err(|e| anyhow::anyhow!("{}", e))?
            * quantity;
        Ok((payout_cents - cost_cents - fee_cents, fee_cents))
    } else {
        Ok((-cost_cents, 0))
    }
}

/// Outcome handed back to the caller so it can drive the cooldown state.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledOutcome {
    pub trade_id: String,
    pub won: bool,
    pub pnl_cents: i64,
    pub fees_cents: i64,
    pub narrative: String,
}

/// Settle one OPEN trade against an observed outcome.
///
/// Adjudicates the bracket, computes cents-exact P&L, writes the single
/// null-to-set settlement transition on the trade row, and stores a
/// human-readable narrative.
pub fn settle_trade(
    db: &Database,
    trade: &TradeRow,
    settlement: &SettlementRow,
    now: DateTime<Utc>,
) -> Result<SettledOutcome> {
    let actual_temp = settlement.actual_high_f;
    let won = did_bracket_win(&trade.bracket_label, actual_temp, trade.side);
    let (pnl_cents, fees_cents) = settlement_pnl(trade.price_cents, trade.quantity, trade.side, won)?;
    let status = if won { TradeStatus::Won } else { TradeStatus::Lost };

    let forecasts = db
        .get_forecasts(trade.city, trade.trade_date)
        .unwrap_or_default();
    let narrative = generate_narrative(trade, actual_temp, pnl_cents, won, &forecasts);

    db.apply_settlement(
        &trade.id,
        status,
        pnl_cents,
        fees_cents,
        actual_temp,
        &settlement.source,
        &narrative,
        now,
    )
    .context("Failed to persist settlement")?;

    info!(
        trade_id = %trade.id,
        status = %status,
        pnl_cents,
        fees_cents,
        actual_temp_f = actual_temp,
        bracket = %trade.bracket_label,
        "Trade settled"
    );

    Ok(SettledOutcome {
        trade_id: trade.id.clone(),
        won,
        pnl_cents,
        fees_cents,
        narrative,
    })
}

/// Settle every OPEN trade whose (city, date) has a recorded observation,
/// updating cooldown state per outcome. Returns the settled outcomes.
pub fn settle_open_trades(
    db: &Database,
    settings: &UserSettings,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<SettledOutcome>> {
    let open_trades = db.get_open_trades(user_id)?;
    let cooldown = CooldownManager::new(settings, db, user_id);
    let mut outcomes = Vec::new();

    for trade in &open_trades {
        let Some(settlement) = db.get_settlement(trade.city, trade.trade_date)? else {
            continue;
        };

        match settle_trade(db, trade, &settlement, now) {
            Ok(outcome) => {
                if outcome.won {
                    cooldown.on_trade_win(now)?;
                } else {
                    cooldown.on_trade_loss(now)?;
                    db.record_daily_loss(user_id, trade.trade_date, -outcome.pnl_cents)?;
                }
                outcomes.push(outcome);
            }
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "Failed to settle trade");
            }
        }
    }

    if !outcomes.is_empty() {
        info!(count = outcomes.len(), "Settlement sweep complete");
    }
    Ok(outcomes)
}

/// Multi-line narrative explaining the outcome: result and P&L, trade
/// details, observed value, model edge, and per-source accuracy for up to
/// the four closest forecasts.
pub fn generate_narrative(
    trade: &TradeRow,
    actual_temp_f: f64,
    pnl_cents: i64,
    won: bool,
    forecasts: &[WeatherObservation],
) -> String {
    let outcome_str = if won {
        format!("WIN (+{}c)", pnl_cents)
    } else {
        format!("LOSS ({}c)", pnl_cents)
    };

    let mut narrative = format!(
        "{}: Bought {} on {} {} at {}c. Actual high was {:.0}F. \
         Our model predicted {:.0}% probability for this bracket.",
        outcome_str,
        trade.side.as_str().to_uppercase(),
        trade.city,
        trade.bracket_label,
        trade.price_cents,
        actual_temp_f,
        trade.model_probability * 100.0,
    );

    let mut ranked: Vec<&WeatherObservation> = forecasts.iter().collect();
    ranked.sort_by(|a, b| {
        let da = (a.forecast_high_f - actual_temp_f).abs();
        let db = (b.forecast_high_f - actual_temp_f).abs();
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });

    let accuracy_lines: Vec<String> = ranked
        .iter()
        .take(4)
        .map(|fc| {
            let diff = fc.forecast_high_f - actual_temp_f;
            format!(
                "{}: {:.0}F ({}{:.0}F off)",
                fc.source,
                fc.forecast_high_f,
                if diff >= 0.0 { "+" } else { "" },
                diff
            )
        })
        .collect();

    if !accuracy_lines.is_empty() {
        narrative.push_str(&format!(" Forecast accuracy: {}.", accuracy_lines.join("; ")));
    }

    narrative
}
