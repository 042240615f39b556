use anyhow::Result;
use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use tracing::info;

use crate::config::UserSettings;
use crate::cooldown::CooldownManager;
use crate::db::Database;
use crate::ev_scanner::TradeSignal;

pub const ET: Tz = New_York;

/// The trading day is the calendar date in Eastern Time; all daily
/// counters reset at midnight ET.
pub fn trading_day_for(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&ET).date_naive()
}

pub fn trading_day() -> NaiveDate {
    trading_day_for(Utc::now())
}

pub fn is_new_trading_day(last_trading_day: NaiveDate) -> bool {
    trading_day() > last_trading_day
}

/// 23:59:59 ET of the current trading day, as a UTC instant.
pub fn end_of_trading_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let day = trading_day_for(now);
    match ET.with_ymd_and_hms(day.year(), day.month(), day.day(), 23, 59, 59) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(_, latest) => latest.with_timezone(&Utc),
        LocalResult::None => now,
    }
}

/// Outcome of the risk predicate. A block is a structured return, not an
/// error; blocked signals are dropped and counted, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Approved,
    Blocked { reason: String },
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskVerdict::Approved)
    }

    pub fn reason(&self) -> &str {
        match self {
            RiskVerdict::Approved => "All checks passed",
            RiskVerdict::Blocked { reason } => reason,
        }
    }
}

/// Enforces all trading risk limits. Monetary comparisons are in integer
/// cents throughout.
pub struct RiskManager<'a> {
    pub settings: &'a UserSettings,
    pub db: &'a Database,
    pub user_id: &'a str,
}

impl<'a> RiskManager<'a> {
    pub fn new(settings: &'a UserSettings, db: &'a Database, user_id: &'a str) -> Self {
        RiskManager {
            settings,
            db,
            user_id,
        }
    }

    /// Run every risk check on a signal, in order; the first failure
    /// short-circuits with a human-readable reason:
    ///   1. cooldown  2. trade size  3. daily exposure  4. daily loss  5. EV
    pub fn check_trade(&self, signal: &TradeSignal, now: DateTime<Utc>) -> Result<RiskVerdict> {
        // 1. Cooldown
        let cooldown = CooldownManager::new(self.settings, self.db, self.user_id);
        let (active, cooldown_reason) = cooldown.is_cooldown_active(now)?;
        if active {
            info!(reason = %cooldown_reason, "Trade blocked: cooldown");
            return Ok(RiskVerdict::Blocked {
                reason: format!("Cooldown active: {}", cooldown_reason),
            });
        }

        // 2. Trade size
        let trade_cost_cents = signal.total_cost_cents();
        if trade_cost_cents > self.settings.max_trade_size_cents {
            info!(
                cost_cents = trade_cost_cents,
                max_cents = self.settings.max_trade_size_cents,
                "Trade blocked: exceeds max trade size"
            );
            return Ok(RiskVerdict::Blocked {
                reason: format!(
                    "Trade cost {}c exceeds max {}c",
                    trade_cost_cents, self.settings.max_trade_size_cents
                ),
            });
        }

        // 3. Daily exposure
        let current_exposure_cents = self.get_open_exposure_cents()?;
        if current_exposure_cents + trade_cost_cents > self.settings.max_daily_exposure_cents {
            info!(
                current_exposure_cents,
                trade_cost_cents,
                limit_cents = self.settings.max_daily_exposure_cents,
                "Trade blocked: daily exposure limit"
            );
            return Ok(RiskVerdict::Blocked {
                reason: format!(
                    "Would exceed daily exposure ({}c + {}c > {}c)",
                    current_exposure_cents,
                    trade_cost_cents,
                    self.settings.max_daily_exposure_cents
                ),
            });
        }

        // 4. Daily loss
        let daily_pnl_cents = self.get_daily_pnl_cents(now)?;
        if daily_pnl_cents <= -self.settings.daily_loss_limit_cents {
            info!(
                daily_pnl_cents,
                limit_cents = self.settings.daily_loss_limit_cents,
                "Trade blocked: daily loss limit"
            );
            return Ok(RiskVerdict::Blocked {
                reason: format!(
                    "Daily loss limit reached (P&L: {}c, limit: -{}c)",
                    daily_pnl_cents, self.settings.daily_loss_limit_cents
                ),
            });
        }

        // 5. EV threshold
        if signal.ev < self.settings.min_ev_threshold {
            return Ok(RiskVerdict::Blocked {
                reason: format!(
                    "EV ${:.4} below threshold ${:.4}",
                    signal.ev, self.settings.min_ev_threshold
                ),
            });
        }

        info!(
            city = %signal.city,
            bracket = %signal.bracket,
            side = %signal.side,
            ev = signal.ev,
            cost_cents = trade_cost_cents,
            "Trade approved by risk manager"
        );
        Ok(RiskVerdict::Approved)
    }

    pub fn get_open_exposure_cents(&self) -> Result<i64> {
        self.db.get_open_exposure_cents(self.user_id)
    }

    pub fn get_daily_pnl_cents(&self, now: DateTime<Utc>) -> Result<i64> {
        self.db
            .get_daily_pnl_cents(self.user_id, trading_day_for(now))
    }

    /// Atomically test the cumulative exposure invariant and reserve.
    ///
    /// The check-and-bump runs under a row-exclusive transaction so two
    /// concurrent cycles cannot double-spend the remaining exposure.
    pub fn check_and_reserve_exposure(
        &self,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let reserved = self.db.reserve_exposure(
            self.user_id,
            trading_day_for(now),
            amount_cents,
            self.settings.max_daily_exposure_cents,
        )?;
        if reserved {
            info!(amount_cents, "Exposure reserved");
        } else {
            info!(requested_cents = amount_cents, "Exposure reservation denied");
        }
        Ok(reserved)
    }

    /// Create today's risk-state row with zeroed counters if absent.
    /// Prior-day rows are never modified or deleted here.
    pub fn handle_daily_reset(&self, now: DateTime<Utc>) -> Result<()> {
        let day = trading_day_for(now);
        let state = self.db.ensure_daily_state(self.user_id, day)?;
        if state.trades_count == 0 && state.total_loss_cents == 0 {
            info!(new_day = %day, "Daily limits reset");
        }
        Ok(())
    }
}
