use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::db::{Database, PendingTradeRow};
use crate::domain::PendingTradeStatus;
use crate::ev_scanner::TradeSignal;

/// Queued trades auto-expire after this TTL.
pub const PENDING_TRADE_TTL_MINUTES: i64 = 30;

/// Queue a signal for manual approval instead of executing it.
///
/// The record starts PENDING and expires after the TTL unless the user
/// acts on it first.
pub fn queue_trade(
    db: &Database,
    signal: &TradeSignal,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<PendingTradeRow> {
    let pending = PendingTradeRow {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        city: signal.city,
        bracket_label: signal.bracket.clone(),
        market_ticker: signal.market_ticker.clone(),
        side: signal.side,
        price_cents: signal.price_cents,
        quantity: signal.quantity,
        model_probability: signal.model_probability,
        market_probability: signal.market_probability,
        ev: signal.ev,
        confidence: signal.confidence,
        reasoning: signal.reasoning.clone(),
        status: PendingTradeStatus::Pending,
        created_at: now,
        expires_at: now + Duration::minutes(PENDING_TRADE_TTL_MINUTES),
        acted_at: None,
    };
    db.insert_pending_trade(&pending)?;

    info!(
        trade_id = %pending.id,
        city = %signal.city,
        bracket = %signal.bracket,
        side = %signal.side,
        price_cents = signal.price_cents,
        ev = signal.ev,
        expires_at = %pending.expires_at,
        "Trade queued for approval"
    );
    Ok(pending)
}

/// Approve a PENDING trade for execution. The caller is responsible for
/// actually executing it and marking it EXECUTED afterwards.
///
/// An approval attempt on a record past its TTL coerces it to EXPIRED
/// and fails.
pub fn approve_trade(db: &Database, trade_id: &str, now: DateTime<Utc>) -> Result<PendingTradeRow> {
    let trade = db
        .get_pending_trade(trade_id)?
        .ok_or_else(|| anyhow::anyhow!("Trade {} not found", trade_id))?;

    if trade.status != PendingTradeStatus::Pending {
        anyhow::bail!("Trade {} is {}, not PENDING", trade_id, trade.status);
    }

    if now > trade.expires_at {
        db.set_pending_status(trade_id, PendingTradeStatus::Expired, Some(now))?;
        anyhow::bail!("Trade {} has expired", trade_id);
    }

    db.set_pending_status(trade_id, PendingTradeStatus::Approved, Some(now))?;
    info!(trade_id, "Trade approved");
    db.get_pending_trade(trade_id)?
        .ok_or_else(|| anyhow::anyhow!("Trade {} vanished after approval", trade_id))
}

/// Reject a PENDING trade.
pub fn reject_trade(db: &Database, trade_id: &str, now: DateTime<Utc>) -> Result<PendingTradeRow> {
    let trade = db
        .get_pending_trade(trade_id)?
        .ok_or_else(|| anyhow::anyhow!("Trade {} not found", trade_id))?;

    if trade.status != PendingTradeStatus::Pending {
        anyhow::bail!("Trade {} is {}, not PENDING", trade_id, trade.status);
    }

    db.set_pending_status(trade_id, PendingTradeStatus::Rejected, Some(now))?;
    info!(trade_id, "Trade rejected");
    db.get_pending_trade(trade_id)?
        .ok_or_else(|| anyhow::anyhow!("Trade {} vanished after rejection", trade_id))
}

/// Mark an approved trade as executed once its order is on the exchange.
pub fn mark_executed(db: &Database, trade_id: &str, now: DateTime<Utc>) -> Result<()> {
    db.set_pending_status(trade_id, PendingTradeStatus::Executed, Some(now))?;
    info!(trade_id, "Pending trade executed");
    Ok(())
}

/// TTL sweep: coerce every PENDING record past its deadline to EXPIRED.
pub fn expire_stale_trades(db: &Database, now: DateTime<Utc>) -> Result<usize> {
    let expired = db.expire_stale_pending(now)?;
    if expired > 0 {
        info!(count = expired, "Expired stale pending trades");
    }
    Ok(expired)
}
