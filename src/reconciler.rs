use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::db::{Database, TradeRow};
use crate::domain::{Confidence, TradeStatus};
use crate::errors::{TradingError, TradingResult};
use crate::kalshi_client::{KalshiClient, KalshiFill, KalshiMarket};
use crate::markets::{bracket_label_from_strikes, city_from_ticker, date_from_ticker, is_weather_ticker};

/// Result of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub synced: u32,
    pub skipped: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

/// Pull the exchange's authoritative filled-order list and create local
/// trade rows for anything missing.
///
/// Skipped: non-weather tickers, fills already recorded (by exchange
/// order id), and zero-filled orders. Recovered rows carry sentinel
/// decision fields (model probability 0, EV 0, low confidence) because
/// the decision-time context is gone. One order's failure never aborts
/// the others.
pub async fn sync_portfolio(
    client: &KalshiClient,
    db: &Database,
    user_id: &str,
) -> TradingResult<SyncReport> {
    let fills = client.get_fills().await?;
    let mut report = SyncReport::default();
    // Strike lookups are cached per ticker for the duration of one run.
    let mut market_cache: HashMap<String, KalshiMarket> = HashMap::new();

    for fill in &fills {
        if !is_weather_ticker(&fill.ticker) {
            report.skipped += 1;
            continue;
        }

        match db.trade_exists_by_order_id(&fill.order_id) {
            Ok(true) => {
                report.skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                report
                    .errors
                    .push(format!("order {}: {}", fill.order_id, e));
                continue;
            }
        }

        if fill.count == 0 {
            report.skipped += 1;
            continue;
        }

        match recover_trade(client, db, user_id, fill, &mut market_cache).await {
            Ok(()) => report.synced += 1,
            Err(e) => {
                report.failed += 1;
                report
                    .errors
                    .push(format!("order {}: {}", fill.order_id, e));
                warn!(order_id = %fill.order_id, error = %e, "Failed to sync fill");
            }
        }
    }

    info!(
        synced = report.synced,
        skipped = report.skipped,
        failed = report.failed,
        "Portfolio reconciliation complete"
    );
    Ok(report)
}

async fn recover_trade(
    client: &KalshiClient,
    db: &Database,
    user_id: &str,
    fill: &KalshiFill,
    market_cache: &mut HashMap<String, KalshiMarket>,
) -> TradingResult<()> {
    let city = city_from_ticker(&fill.ticker).ok_or_else(|| {
        TradingError::input(format!("cannot derive city from ticker '{}'", fill.ticker))
    })?;
    let trade_date = date_from_ticker(&fill.ticker).ok_or_else(|| {
        TradingError::input(format!("cannot derive date from ticker '{}'", fill.ticker))
    })?;

    if !market_cache.contains_key(&fill.ticker) {
        let market = client.get_market(&fill.ticker).await?;
        market_cache.insert(fill.ticker.clone(), market);
    }
    let market = &market_cache[&fill.ticker];

    let bracket_label = bracket_label_from_strikes(market.floor_strike, market.cap_strike)
        .ok_or_else(|| {
            TradingError::input(format!("market '{}' has no strike bounds", fill.ticker))
        })?;

    let now = fill.created_time.unwrap_or_else(Utc::now);
    let trade = TradeRow {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        kalshi_order_id: Some(fill.order_id.clone()),
        city,
        trade_date,
        market_ticker: Some(fill.ticker.clone()),
        bracket_label,
        side: fill.side,
        price_cents: fill.yes_price,
        quantity: fill.count,
        // Decision-time context is unknown for recovered fills.
        model_probability: 0.0,
        market_probability: 0.0,
        ev_at_entry: 0.0,
        confidence: Confidence::Low,
        status: TradeStatus::Open,
        settlement_temp_f: None,
        settlement_source: None,
        pnl_cents: None,
        fees_cents: None,
        postmortem: None,
        created_at: now,
        settled_at: None,
    };

    db.insert_trade(&trade).map_err(TradingError::storage)?;
    info!(
        order_id = %fill.order_id,
        ticker = %fill.ticker,
        city = %city,
        "Recovered missing trade from exchange fills"
    );
    Ok(())
}
