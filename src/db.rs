use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::{
    City, Confidence, PendingTradeStatus, Side, TradeStatus, WeatherObservation,
};

/// Durable record of an executed order.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRow {
    pub id: String,
    pub user_id: String,
    pub kalshi_order_id: Option<String>,
    pub city: City,
    /// Trading day the order was placed (Eastern-date of execution).
    pub trade_date: NaiveDate,
    pub market_ticker: Option<String>,
    pub bracket_label: String,
    pub side: Side,
    pub price_cents: i64,
    pub quantity: i64,
    pub model_probability: f64,
    pub market_probability: f64,
    pub ev_at_entry: f64,
    pub confidence: Confidence,
    pub status: TradeStatus,
    pub settlement_temp_f: Option<f64>,
    pub settlement_source: Option<String>,
    pub pnl_cents: Option<i64>,
    pub fees_cents: Option<i64>,
    pub postmortem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// A queued signal awaiting user action in manual mode.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTradeRow {
    pub id: String,
    pub user_id: String,
    pub city: City,
    pub bracket_label: String,
    pub market_ticker: String,
    pub side: Side,
    pub price_cents: i64,
    pub quantity: i64,
    pub model_probability: f64,
    pub market_probability: f64,
    pub ev: f64,
    pub confidence: Confidence,
    pub reasoning: String,
    pub status: PendingTradeStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub acted_at: Option<DateTime<Utc>>,
}

/// Per-(user, trading-day) mutable risk counters.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRiskStateRow {
    pub user_id: String,
    pub trading_day: NaiveDate,
    pub total_loss_cents: i64,
    pub total_exposure_cents: i64,
    pub consecutive_losses: i64,
    pub trades_count: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Observed outcome for one (city, date).
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRow {
    pub city: City,
    pub settlement_date: NaiveDate,
    pub actual_high_f: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database: {}", path))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        let db = Database { conn };
        db.run_migrations()?;
        db.enable_wal()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn enable_wal(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kalshi_order_id TEXT,
                city TEXT NOT NULL,
                trade_date TEXT NOT NULL,
                market_ticker TEXT,
                bracket_label TEXT NOT NULL,
                side TEXT NOT NULL,
                price_cents INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                model_probability REAL NOT NULL,
                market_probability REAL NOT NULL,
                ev_at_entry REAL NOT NULL,
                confidence TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                settlement_temp_f REAL,
                settlement_source TEXT,
                pnl_cents INTEGER,
                fees_cents INTEGER,
                postmortem TEXT,
                created_at TEXT NOT NULL,
                settled_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
            CREATE INDEX IF NOT EXISTS idx_trades_order_id ON trades(kalshi_order_id);
            CREATE INDEX IF NOT EXISTS idx_trades_user_day ON trades(user_id, trade_date);

            CREATE TABLE IF NOT EXISTS pending_trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                city TEXT NOT NULL,
                bracket_label TEXT NOT NULL,
                market_ticker TEXT NOT NULL,
                side TEXT NOT NULL,
                price_cents INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                model_probability REAL NOT NULL,
                market_probability REAL NOT NULL,
                ev REAL NOT NULL,
                confidence TEXT NOT NULL,
                reasoning TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                acted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_trades(status);

            CREATE TABLE IF NOT EXISTS daily_risk_state (
                user_id TEXT NOT NULL,
                trading_day TEXT NOT NULL,
                total_loss_cents INTEGER NOT NULL DEFAULT 0,
                total_exposure_cents INTEGER NOT NULL DEFAULT 0,
                consecutive_losses INTEGER NOT NULL DEFAULT 0,
                trades_count INTEGER NOT NULL DEFAULT 0,
                cooldown_until TEXT,
                PRIMARY KEY (user_id, trading_day)
            );

            CREATE TABLE IF NOT EXISTS forecasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                city TEXT NOT NULL,
                forecast_date TEXT NOT NULL,
                forecast_high_f REAL NOT NULL,
                fetched_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_forecasts_city_date ON forecasts(city, forecast_date);

            CREATE TABLE IF NOT EXISTS settlements (
                city TEXT NOT NULL,
                settlement_date TEXT NOT NULL,
                actual_high_f REAL NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                PRIMARY KEY (city, settlement_date)
            );
            ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    // ─── Trades ───

    pub fn insert_trade(&self, trade: &TradeRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO trades (id, user_id, kalshi_order_id, city, trade_date, market_ticker,
                    bracket_label, side, price_cents, quantity, model_probability,
                    market_probability, ev_at_entry, confidence, status, settlement_temp_f,
                    settlement_source, pnl_cents, fees_cents, postmortem, created_at, settled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22)",
                rusqlite::params![
                    trade.id,
                    trade.user_id,
                    trade.kalshi_order_id,
                    trade.city.as_str(),
                    trade.trade_date.to_string(),
                    trade.market_ticker,
                    trade.bracket_label,
                    trade.side.as_str(),
                    trade.price_cents,
                    trade.quantity,
                    trade.model_probability,
                    trade.market_probability,
                    trade.ev_at_entry,
                    trade.confidence.as_str(),
                    trade.status.as_str(),
                    trade.settlement_temp_f,
                    trade.settlement_source,
                    trade.pnl_cents,
                    trade.fees_cents,
                    trade.postmortem,
                    trade.created_at.to_rfc3339(),
                    trade.settled_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("Failed to insert trade")?;
        Ok(())
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Option<TradeRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", TRADE_SELECT))
            .context("Failed to prepare trade query")?;
        let mut rows = stmt
            .query_map([trade_id], trade_from_row)
            .context("Failed to query trade")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to map trade row")?)),
            None => Ok(None),
        }
    }

    pub fn trade_exists_by_order_id(&self, kalshi_order_id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM trades WHERE kalshi_order_id = ?1",
                [kalshi_order_id],
                |row| row.get(0),
            )
            .context("Failed to check order id")?;
        Ok(count > 0)
    }

    pub fn get_open_trades(&self, user_id: &str) -> Result<Vec<TradeRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE user_id = ?1 AND status = 'OPEN' ORDER BY created_at",
                TRADE_SELECT
            ))
            .context("Failed to prepare open trades query")?;
        let rows = stmt
            .query_map([user_id], trade_from_row)
            .context("Failed to query open trades")?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.context("Failed to map open trade")?);
        }
        Ok(trades)
    }

    /// Sum of price_cents * quantity over all OPEN trades for a user.
    pub fn get_open_exposure_cents(&self, user_id: &str) -> Result<i64> {
        let exposure: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(price_cents * quantity), 0) FROM trades
                 WHERE user_id = ?1 AND status = 'OPEN'",
                [user_id],
                |row| row.get(0),
            )
            .context("Failed to get open exposure")?;
        Ok(exposure)
    }

    /// Realized P&L in cents over settled trades placed on the given day.
    pub fn get_daily_pnl_cents(&self, user_id: &str, trading_day: NaiveDate) -> Result<i64> {
        let pnl: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(pnl_cents), 0) FROM trades
                 WHERE user_id = ?1 AND settled_at IS NOT NULL AND trade_date = ?2",
                rusqlite::params![user_id, trading_day.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get daily pnl")?;
        Ok(pnl)
    }

    /// Single transition of a trade's settlement fields from null to set.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_settlement(
        &self,
        trade_id: &str,
        status: TradeStatus,
        pnl_cents: i64,
        fees_cents: i64,
        settlement_temp_f: f64,
        settlement_source: &str,
        postmortem: &str,
        settled_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE trades SET status = ?1, pnl_cents = ?2, fees_cents = ?3,
                    settlement_temp_f = ?4, settlement_source = ?5, postmortem = ?6,
                    settled_at = ?7
                 WHERE id = ?8 AND settled_at IS NULL",
                rusqlite::params![
                    status.as_str(),
                    pnl_cents,
                    fees_cents,
                    settlement_temp_f,
                    settlement_source,
                    postmortem,
                    settled_at.to_rfc3339(),
                    trade_id,
                ],
            )
            .context("Failed to apply settlement")?;
        if updated == 0 {
            anyhow::bail!("Trade {} not found or already settled", trade_id);
        }
        Ok(())
    }

    // ─── Daily risk state ───

    pub fn get_daily_state(
        &self,
        user_id: &str,
        trading_day: NaiveDate,
    ) -> Result<Option<DailyRiskStateRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, trading_day, total_loss_cents, total_exposure_cents,
                    consecutive_losses, trades_count, cooldown_until
                 FROM daily_risk_state WHERE user_id = ?1 AND trading_day = ?2",
            )
            .context("Failed to prepare daily state query")?;
        let mut rows = stmt
            .query_map(
                rusqlite::params![user_id, trading_day.to_string()],
                daily_state_from_row,
            )
            .context("Failed to query daily state")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to map daily state")?)),
            None => Ok(None),
        }
    }

    /// Create today's row with zeroed counters if it does not exist yet.
    pub fn ensure_daily_state(
        &self,
        user_id: &str,
        trading_day: NaiveDate,
    ) -> Result<DailyRiskStateRow> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO daily_risk_state (user_id, trading_day) VALUES (?1, ?2)",
                rusqlite::params![user_id, trading_day.to_string()],
            )
            .context("Failed to ensure daily state")?;
        self.get_daily_state(user_id, trading_day)?
            .context("Daily state missing after insert")
    }

    pub fn update_cooldown_state(
        &self,
        user_id: &str,
        trading_day: NaiveDate,
        cooldown_until: Option<DateTime<Utc>>,
        consecutive_losses: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE daily_risk_state SET cooldown_until = ?1, consecutive_losses = ?2
                 WHERE user_id = ?3 AND trading_day = ?4",
                rusqlite::params![
                    cooldown_until.map(|t| t.to_rfc3339()),
                    consecutive_losses,
                    user_id,
                    trading_day.to_string(),
                ],
            )
            .context("Failed to update cooldown state")?;
        Ok(())
    }

    pub fn record_daily_loss(
        &self,
        user_id: &str,
        trading_day: NaiveDate,
        loss_cents: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE daily_risk_state SET total_loss_cents = total_loss_cents + ?1
                 WHERE user_id = ?2 AND trading_day = ?3",
                rusqlite::params![loss_cents, user_id, trading_day.to_string()],
            )
            .context("Failed to record daily loss")?;
        Ok(())
    }

    /// Atomically check the cumulative exposure invariant and reserve.
    ///
    /// Runs the read-check-write under BEGIN IMMEDIATE so a concurrent
    /// writer on another connection cannot interleave; exactly one of two
    /// racing reservations for the last slice of exposure succeeds.
    pub fn reserve_exposure(
        &self,
        user_id: &str,
        trading_day: NaiveDate,
        amount_cents: i64,
        limit_cents: i64,
    ) -> Result<bool> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin exposure reservation")?;

        let result: Result<bool> = (|| {
            self.conn.execute(
                "INSERT OR IGNORE INTO daily_risk_state (user_id, trading_day) VALUES (?1, ?2)",
                rusqlite::params![user_id, trading_day.to_string()],
            )?;
            let current: i64 = self.conn.query_row(
                "SELECT total_exposure_cents FROM daily_risk_state
                 WHERE user_id = ?1 AND trading_day = ?2",
                rusqlite::params![user_id, trading_day.to_string()],
                |row| row.get(0),
            )?;

            if current + amount_cents > limit_cents {
                return Ok(false);
            }

            self.conn.execute(
                "UPDATE daily_risk_state
                 SET total_exposure_cents = total_exposure_cents + ?1,
                     trades_count = trades_count + 1
                 WHERE user_id = ?2 AND trading_day = ?3",
                rusqlite::params![amount_cents, user_id, trading_day.to_string()],
            )?;
            Ok(true)
        })();

        match result {
            Ok(reserved) => {
                self.conn
                    .execute_batch("COMMIT")
                    .context("Failed to commit exposure reservation")?;
                Ok(reserved)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e).context("Exposure reservation failed")
            }
        }
    }

    // ─── Pending trades ───

    pub fn insert_pending_trade(&self, pending: &PendingTradeRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pending_trades (id, user_id, city, bracket_label, market_ticker,
                    side, price_cents, quantity, model_probability, market_probability, ev,
                    confidence, reasoning, status, created_at, expires_at, acted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                rusqlite::params![
                    pending.id,
                    pending.user_id,
                    pending.city.as_str(),
                    pending.bracket_label,
                    pending.market_ticker,
                    pending.side.as_str(),
                    pending.price_cents,
                    pending.quantity,
                    pending.model_probability,
                    pending.market_probability,
                    pending.ev,
                    pending.confidence.as_str(),
                    pending.reasoning,
                    pending.status.as_str(),
                    pending.created_at.to_rfc3339(),
                    pending.expires_at.to_rfc3339(),
                    pending.acted_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("Failed to insert pending trade")?;
        Ok(())
    }

    pub fn get_pending_trade(&self, id: &str) -> Result<Option<PendingTradeRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", PENDING_SELECT))
            .context("Failed to prepare pending trade query")?;
        let mut rows = stmt
            .query_map([id], pending_from_row)
            .context("Failed to query pending trade")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to map pending trade")?)),
            None => Ok(None),
        }
    }

    pub fn list_pending_by_status(
        &self,
        status: PendingTradeStatus,
    ) -> Result<Vec<PendingTradeRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE status = ?1 ORDER BY created_at",
                PENDING_SELECT
            ))
            .context("Failed to prepare pending list query")?;
        let rows = stmt
            .query_map([status.as_str()], pending_from_row)
            .context("Failed to query pending trades")?;
        let mut pendings = Vec::new();
        for row in rows {
            pendings.push(row.context("Failed to map pending trade")?);
        }
        Ok(pendings)
    }

    pub fn set_pending_status(
        &self,
        id: &str,
        status: PendingTradeStatus,
        acted_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pending_trades SET status = ?1, acted_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), acted_at.map(|t| t.to_rfc3339()), id],
            )
            .context("Failed to set pending status")?;
        Ok(())
    }

    /// Coerce PENDING records past their TTL to EXPIRED. Returns the count.
    pub fn expire_stale_pending(&self, now: DateTime<Utc>) -> Result<usize> {
        let updated = self
            .conn
            .execute(
                "UPDATE pending_trades SET status = 'EXPIRED', acted_at = ?1
                 WHERE status = 'PENDING' AND expires_at < ?1",
                rusqlite::params![now.to_rfc3339()],
            )
            .context("Failed to expire pending trades")?;
        Ok(updated)
    }

    // ─── Forecasts & settlements ───

    pub fn insert_forecast(
        &self,
        source: &str,
        city: City,
        forecast_date: NaiveDate,
        forecast_high_f: f64,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO forecasts (source, city, forecast_date, forecast_high_f, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    source,
                    city.as_str(),
                    forecast_date.to_string(),
                    forecast_high_f,
                    fetched_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert forecast")?;
        Ok(())
    }

    pub fn get_forecasts(&self, city: City, date: NaiveDate) -> Result<Vec<WeatherObservation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source, city, forecast_date, forecast_high_f, fetched_at
                 FROM forecasts WHERE city = ?1 AND forecast_date = ?2 ORDER BY fetched_at",
            )
            .context("Failed to prepare forecasts query")?;
        let rows = stmt
            .query_map(
                rusqlite::params![city.as_str(), date.to_string()],
                |row| {
                    Ok(WeatherObservation {
                        source: row.get(0)?,
                        city: parse_col(row.get::<_, String>(1)?, 1)?,
                        date: parse_col(row.get::<_, String>(2)?, 2)?,
                        forecast_high_f: row.get(3)?,
                        fetched_at: parse_ts(&row.get::<_, String>(4)?, 4)?,
                    })
                },
            )
            .context("Failed to query forecasts")?;
        let mut forecasts = Vec::new();
        for row in rows {
            forecasts.push(row.context("Failed to map forecast")?);
        }
        Ok(forecasts)
    }

    /// Historical (actual - forecast) errors for a city, restricted to the
    /// given source and calendar months.
    pub fn get_forecast_errors(
        &self,
        city: City,
        source: &str,
        months: &[u32],
    ) -> Result<Vec<f64>> {
        let month_list = months
            .iter()
            .map(|m| format!("'{:02}'", m))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT f.forecast_high_f, s.actual_high_f
             FROM forecasts f
             JOIN settlements s ON f.city = s.city AND f.forecast_date = s.settlement_date
             WHERE f.city = ?1 AND f.source = ?2
               AND strftime('%m', f.forecast_date) IN ({})",
            month_list
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare forecast errors query")?;
        let rows = stmt
            .query_map(rusqlite::params![city.as_str(), source], |row| {
                let forecast: f64 = row.get(0)?;
                let actual: f64 = row.get(1)?;
                Ok(actual - forecast)
            })
            .context("Failed to query forecast errors")?;
        let mut errors = Vec::new();
        for row in rows {
            errors.push(row.context("Failed to map forecast error")?);
        }
        Ok(errors)
    }

    pub fn upsert_settlement(
        &self,
        city: City,
        settlement_date: NaiveDate,
        actual_high_f: f64,
        source: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settlements (city, settlement_date, actual_high_f, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(city, settlement_date) DO UPDATE SET
                    actual_high_f = excluded.actual_high_f,
                    source = excluded.source",
                rusqlite::params![
                    city.as_str(),
                    settlement_date.to_string(),
                    actual_high_f,
                    source,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to upsert settlement")?;
        Ok(())
    }

    pub fn get_settlement(
        &self,
        city: City,
        settlement_date: NaiveDate,
    ) -> Result<Option<SettlementRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT city, settlement_date, actual_high_f, source, created_at
                 FROM settlements WHERE city = ?1 AND settlement_date = ?2",
            )
            .context("Failed to prepare settlement query")?;
        let mut rows = stmt
            .query_map(
                rusqlite::params![city.as_str(), settlement_date.to_string()],
                |row| {
                    Ok(SettlementRow {
                        city: parse_col(row.get::<_, String>(0)?, 0)?,
                        settlement_date: parse_col(row.get::<_, String>(1)?, 1)?,
                        actual_high_f: row.get(2)?,
                        source: row.get(3)?,
                        created_at: parse_ts(&row.get::<_, String>(4)?, 4)?,
                    })
                },
            )
            .context("Failed to query settlement")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to map settlement")?)),
            None => Ok(None),
        }
    }
}

const TRADE_SELECT: &str = "SELECT id, user_id, kalshi_order_id, city, trade_date, market_ticker,
    bracket_label, side, price_cents, quantity, model_probability, market_probability,
    ev_at_entry, confidence, status, settlement_temp_f, settlement_source, pnl_cents,
    fees_cents, postmortem, created_at, settled_at FROM trades";

const PENDING_SELECT: &str = "SELECT id, user_id, city, bracket_label, market_ticker, side,
    price_cents, quantity, model_probability, market_probability, ev, confidence, reasoning,
    status, created_at, expires_at, acted_at FROM pending_trades";

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
    Ok(TradeRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kalshi_order_id: row.get(2)?,
        city: parse_col(row.get::<_, String>(3)?, 3)?,
        trade_date: parse_col(row.get::<_, String>(4)?, 4)?,
        market_ticker: row.get(5)?,
        bracket_label: row.get(6)?,
        side: parse_col(row.get::<_, String>(7)?, 7)?,
        price_cents: row.get(8)?,
        quantity: row.get(9)?,
        model_probability: row.get(10)?,
        market_probability: row.get(11)?,
        ev_at_entry: row.get(12)?,
        confidence: parse_col(row.get::<_, String>(13)?, 13)?,
        status: parse_col(row.get::<_, String>(14)?, 14)?,
        settlement_temp_f: row.get(15)?,
        settlement_source: row.get(16)?,
        pnl_cents: row.get(17)?,
        fees_cents: row.get(18)?,
        postmortem: row.get(19)?,
        created_at: parse_ts(&row.get::<_, String>(20)?, 20)?,
        settled_at: parse_opt_ts(row.get::<_, Option<String>>(21)?, 21)?,
    })
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingTradeRow> {
    Ok(PendingTradeRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        city: parse_col(row.get::<_, String>(2)?, 2)?,
        bracket_label: row.get(3)?,
        market_ticker: row.get(4)?,
        side: parse_col(row.get::<_, String>(5)?, 5)?,
        price_cents: row.get(6)?,
        quantity: row.get(7)?,
        model_probability: row.get(8)?,
        market_probability: row.get(9)?,
        ev: row.get(10)?,
        confidence: parse_col(row.get::<_, String>(11)?, 11)?,
        reasoning: row.get(12)?,
        status: parse_col(row.get::<_, String>(13)?, 13)?,
        created_at: parse_ts(&row.get::<_, String>(14)?, 14)?,
        expires_at: parse_ts(&row.get::<_, String>(15)?, 15)?,
        acted_at: parse_opt_ts(row.get::<_, Option<String>>(16)?, 16)?,
    })
}

fn daily_state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyRiskStateRow> {
    Ok(DailyRiskStateRow {
        user_id: row.get(0)?,
        trading_day: parse_col(row.get::<_, String>(1)?, 1)?,
        total_loss_cents: row.get(2)?,
        total_exposure_cents: row.get(3)?,
        consecutive_losses: row.get(4)?,
        trades_count: row.get(5)?,
        cooldown_until: parse_opt_ts(row.get::<_, Option<String>>(6)?, 6)?,
    })
}

fn parse_col<T: FromStr>(value: String, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn parse_ts(value: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(value: Option<String>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match value {
        Some(v) => Ok(Some(parse_ts(&v, idx)?)),
        None => Ok(None),
    }
}
