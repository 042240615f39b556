use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::db::{Database, TradeRow};
use crate::domain::TradeStatus;
use crate::errors::{ErrorContext, TradingError, TradingResult};
use crate::ev_scanner::TradeSignal;
use crate::kalshi_client::{KalshiClient, OrderAction, OrderRequest, OrderType};
use crate::risk::trading_day_for;

/// Execute a validated signal: place the order and record the trade.
///
/// Flow: build a limit buy order from the signal, submit it, then write a
/// durable OPEN trade row. A CANCELED response is surfaced as a rejection
/// and leaves no row; RESTING is recorded normally (the order sits on the
/// book). The recorded quantity is the exchange's filled count, which can
/// differ from the requested count on partial fills.
pub async fn execute_trade(
    signal: &TradeSignal,
    client: &KalshiClient,
    db: &Database,
    user_id: &str,
    now: DateTime<Utc>,
) -> TradingResult<TradeRow> {
    let order = OrderRequest {
        ticker: signal.market_ticker.clone(),
        action: OrderAction::Buy,
        side: signal.side,
        order_type: OrderType::Limit,
        count: signal.quantity,
        yes_price: signal.price_cents,
    };

    info!(
        ticker = %signal.market_ticker,
        side = %signal.side,
        price_cents = signal.price_cents,
        quantity = signal.quantity,
        "Placing order"
    );

    let response = client.place_order(&order).await?;

    if response.status == "canceled" {
        warn!(order_id = %response.order_id, "Order was canceled by exchange");
        return Err(TradingError::OrderRejected {
            message: "Order canceled by exchange".to_string(),
            context: ErrorContext::new()
                .with("order_id", response.order_id)
                .with("ticker", signal.market_ticker.clone()),
        });
    }

    if response.status == "resting" {
        info!(
            order_id = %response.order_id,
            ticker = %signal.market_ticker,
            count = response.count,
            "Order resting (not yet filled)"
        );
    }

    let trade = TradeRow {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        kalshi_order_id: Some(response.order_id.clone()),
        city: signal.city,
        trade_date: trading_day_for(now),
        market_ticker: Some(signal.market_ticker.clone()),
        bracket_label: signal.bracket.clone(),
        side: signal.side,
        price_cents: signal.price_cents,
        quantity: response.count,
        model_probability: signal.model_probability,
        market_probability: signal.market_probability,
        ev_at_entry: signal.ev,
        confidence: signal.confidence,
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
        trade_id = %trade.id,
        order_id = %response.order_id,
        city = %signal.city,
        bracket = %signal.bracket,
        side = %signal.side,
        price_cents = signal.price_cents,
        quantity = trade.quantity,
        ev = signal.ev,
        "Trade executed and recorded"
    );
    Ok(trade)
}
