use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

use crate::domain::City;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradingMode {
    Auto,
    Manual,
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(TradingMode::Auto),
            "manual" => Ok(TradingMode::Manual),
            _ => anyhow::bail!("Invalid trading mode: '{}'. Must be 'auto' or 'manual'", s),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Auto => write!(f, "auto"),
            TradingMode::Manual => write!(f, "manual"),
        }
    }
}

/// Per-user trading behavior and risk limits.
///
/// Defaults are deliberately conservative: manual approval, demo exchange,
/// $1 max trade, flat 1-contract sizing.
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub trading_mode: TradingMode,
    pub max_trade_size_cents: i64,
    pub daily_loss_limit_cents: i64,
    pub max_daily_exposure_cents: i64,
    pub min_ev_threshold: f64,
    pub cooldown_per_loss_minutes: i64,
    pub consecutive_loss_limit: i64,
    pub active_cities: Vec<City>,
    pub demo_mode: bool,
    pub notifications_enabled: bool,
    pub use_kelly_sizing: bool,
    pub kelly_fraction: f64,
    pub max_bankroll_pct_per_trade: f64,
    pub max_contracts_per_trade: i64,
}

impl Default for UserSettings {
    fn default() -> Self {
        UserSettings {
            trading_mode: TradingMode::Manual,
            max_trade_size_cents: 100,
            daily_loss_limit_cents: 1000,
            max_daily_exposure_cents: 2500,
            min_ev_threshold: 0.05,
            cooldown_per_loss_minutes: 60,
            consecutive_loss_limit: 3,
            active_cities: City::ALL.to_vec(),
            demo_mode: true,
            notifications_enabled: true,
            use_kelly_sizing: false,
            kelly_fraction: 0.25,
            max_bankroll_pct_per_trade: 0.05,
            max_contracts_per_trade: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Exchange credentials
    pub kalshi_api_key_id: String,
    pub kalshi_private_key_path: String,
    // Persistence
    pub database_path: String,
    pub redis_url: String,
    // Market-data feed
    pub kalshi_ws_cache_ttl_seconds: u64,
    pub kalshi_ws_refresh_minutes: u64,
    // Orchestration
    pub cycle_interval_secs: u64,
    pub request_timeout_secs: u64,
    // Learned forecast blending (0.0 disables)
    pub xgb_ensemble_weight: f64,
    // Per-user settings
    pub settings: UserSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Don't fail if .env missing

        let settings = UserSettings {
            trading_mode: env::var("TRADING_MODE")
                .unwrap_or_else(|_| "manual".to_string())
                .parse()
                .context("Failed to parse TRADING_MODE")?,
            max_trade_size_cents: parse_env("MAX_TRADE_SIZE_CENTS", "100")?,
            daily_loss_limit_cents: parse_env("DAILY_LOSS_LIMIT_CENTS", "1000")?,
            max_daily_exposure_cents: parse_env("MAX_DAILY_EXPOSURE_CENTS", "2500")?,
            min_ev_threshold: parse_env("MIN_EV_THRESHOLD", "0.05")?,
            cooldown_per_loss_minutes: parse_env("COOLDOWN_PER_LOSS_MINUTES", "60")?,
            consecutive_loss_limit: parse_env("CONSECUTIVE_LOSS_LIMIT", "3")?,
            active_cities: parse_cities(
                &env::var("ACTIVE_CITIES").unwrap_or_else(|_| "NYC,CHI,MIA,AUS".to_string()),
            )?,
            demo_mode: parse_env("KALSHI_DEMO_MODE", "true")?,
            notifications_enabled: parse_env("NOTIFICATIONS_ENABLED", "true")?,
            use_kelly_sizing: parse_env("USE_KELLY_SIZING", "false")?,
            kelly_fraction: parse_env("KELLY_FRACTION", "0.25")?,
            max_bankroll_pct_per_trade: parse_env("MAX_BANKROLL_PCT_PER_TRADE", "0.05")?,
            max_contracts_per_trade: parse_env("MAX_CONTRACTS_PER_TRADE", "10")?,
        };

        Ok(Config {
            kalshi_api_key_id: env::var("KALSHI_API_KEY_ID").unwrap_or_default(),
            kalshi_private_key_path: env::var("KALSHI_PRIVATE_KEY_PATH").unwrap_or_default(),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/weather-trader.db".to_string()),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            kalshi_ws_cache_ttl_seconds: parse_env("KALSHI_WS_CACHE_TTL_SECONDS", "120")?,
            kalshi_ws_refresh_minutes: parse_env("KALSHI_WS_REFRESH_MINUTES", "5")?,
            cycle_interval_secs: parse_env("CYCLE_INTERVAL_SECS", "300")?,
            request_timeout_secs: parse_env("REQUEST_TIMEOUT_SECS", "30")?,
            xgb_ensemble_weight: parse_env("XGB_ENSEMBLE_WEIGHT", "0.0")?,
            settings,
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.kalshi_api_key_id.is_empty() && !self.kalshi_private_key_path.is_empty()
    }
}

fn parse_env<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Failed to parse {}", name))
}

fn parse_cities(raw: &str) -> Result<Vec<City>> {
    let mut cities = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        cities.push(
            part.parse::<City>()
                .map_err(|e| anyhow::anyhow!("Failed to parse ACTIVE_CITIES: {}", e))?,
        );
    }
    if cities.is_empty() {
        anyhow::bail!("ACTIVE_CITIES must name at least one city");
    }
    Ok(cities)
}
