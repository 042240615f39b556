use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, warn};

use weather_trader::auth::ExchangeAuth;
use weather_trader::brackets::BracketDef;
use weather_trader::config::{Config, TradingMode};
use weather_trader::db::Database;
use weather_trader::domain::{BracketBounds, City, PendingTradeStatus};
use weather_trader::ev_scanner::{
    scan_all_brackets, validate_market_prices, validate_predictions, SizingContext, TradeSignal,
};
use weather_trader::executor::execute_trade;
use weather_trader::kalshi_client::KalshiClient;
use weather_trader::kelly::KellySettings;
use weather_trader::market_feed::run_market_feed;
use weather_trader::markets::date_str_yymmdd;
use weather_trader::prediction::generate_prediction;
use weather_trader::price_cache::PriceCache;
use weather_trader::risk::{trading_day_for, RiskManager};
use weather_trader::settlement::settle_open_trades;
use weather_trader::trade_queue::{expire_stale_trades, mark_executed, queue_trade};

/// Single-operator deployment: one user owns every trade row.
const USER_ID: &str = "default";

#[derive(Debug, Default)]
struct CycleSummary {
    cities_scanned: u32,
    signals_found: u32,
    trades_executed: u32,
    trades_queued: u32,
    trades_blocked: u32,
    trades_settled: u32,
    pending_expired: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("weather_trader=info")),
        )
        .init();

    info!(
        mode = %config.settings.trading_mode,
        demo = config.settings.demo_mode,
        cities = ?config.settings.active_cities,
        "Weather trader starting"
    );
    info!(
        max_trade_size_cents = config.settings.max_trade_size_cents,
        daily_loss_limit_cents = config.settings.daily_loss_limit_cents,
        max_daily_exposure_cents = config.settings.max_daily_exposure_cents,
        min_ev_threshold = config.settings.min_ev_threshold,
        use_kelly = config.settings.use_kelly_sizing,
        "Risk limits loaded"
    );

    let db = Database::open(&config.database_path)?;
    info!(path = %config.database_path, "Database initialized");

    // Exchange client is optional until the user has onboarded credentials.
    let client = build_exchange_client(&config);
    if client.is_none() {
        warn!("No exchange credentials configured — running in observe-only mode");
    }

    // Market-data feed runs as its own background task; it owns its own
    // WebSocket, REST client, and cache connection.
    {
        let feed_config = config.clone();
        tokio::spawn(async move {
            run_market_feed(feed_config).await;
        });
        info!("Market feed task spawned");
    }

    let mut cache = match PriceCache::connect(&config.redis_url, config.kalshi_ws_cache_ttl_seconds)
        .await
    {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(error = %e, "Price cache unavailable at startup; cycles will retry");
            None
        }
    };

    let mut cycle_number: u64 = 1;
    loop {
        let cycle_start = tokio::time::Instant::now();
        info!(cycle = cycle_number, "═══ Trading cycle starting ═══");

        if cache.is_none() {
            cache = PriceCache::connect(&config.redis_url, config.kalshi_ws_cache_ttl_seconds)
                .await
                .map_err(|e| warn!(error = %e, "Price cache still unavailable"))
                .ok();
        }

        match run_cycle(&config, &db, client.as_ref(), cache.as_mut()).await {
            Ok(summary) => {
                info!(
                    cycle = cycle_number,
                    cities_scanned = summary.cities_scanned,
                    signals = summary.signals_found,
                    executed = summary.trades_executed,
                    queued = summary.trades_queued,
                    blocked = summary.trades_blocked,
                    settled = summary.trades_settled,
                    expired = summary.pending_expired,
                    "═══ Trading cycle complete ═══"
                );
            }
            Err(e) => {
                // Background-plane tasks never crash on a bad cycle.
                error!(cycle = cycle_number, error = %e, "Trading cycle failed");
            }
        }

        cycle_number += 1;

        let elapsed = cycle_start.elapsed();
        let sleep_duration =
            Duration::from_secs(config.cycle_interval_secs).saturating_sub(elapsed);

        tokio::select! {
            _ = tokio::time::sleep(sleep_duration) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received — shutting down gracefully");
                // The feed task dies with the process; leave the liveness
                // key honest for anyone still watching it.
                if let Some(cache) = cache.as_mut() {
                    if let Err(e) = cache.set_feed_status(false).await {
                        warn!(error = %e, "Failed to flush feed status on shutdown");
                    }
                }
                return Ok(());
            }
        }
    }
}

fn build_exchange_client(config: &Config) -> Option<KalshiClient> {
    if !config.has_credentials() {
        return None;
    }
    let pem = match std::fs::read_to_string(&config.kalshi_private_key_path) {
        Ok(pem) => pem,
        Err(e) => {
            error!(error = %e, "Failed to read private key file");
            return None;
        }
    };
    let auth = match ExchangeAuth::new(&config.kalshi_api_key_id, &pem) {
        Ok(auth) => auth,
        Err(e) => {
            error!(error = %e, "Failed to initialize exchange auth");
            return None;
        }
    };
    match KalshiClient::new(auth, config.settings.demo_mode, config.request_timeout_secs) {
        Ok(client) => Some(client),
        Err(e) => {
            error!(error = %e, "Failed to build exchange client");
            None
        }
    }
}

/// One trading cycle: per-city scan in lexicographic order, risk checks,
/// execution or queueing, then the settlement sweep and the pending-trade
/// TTL sweep.
async fn run_cycle(
    config: &Config,
    db: &Database,
    client: Option<&KalshiClient>,
    cache: Option<&mut PriceCache>,
) -> Result<CycleSummary> {
    let now = Utc::now();
    let mut summary = CycleSummary::default();
    let settings = &config.settings;
    let risk = RiskManager::new(settings, db, USER_ID);
    risk.handle_daily_reset(now)?;

    // Bankroll for Kelly sizing comes from the live exchange balance.
    let sizing = match (settings.use_kelly_sizing, client) {
        (true, Some(client)) => match client.get_balance_cents().await {
            Ok(bankroll_cents) => Some(SizingContext {
                settings: KellySettings {
                    use_kelly_sizing: true,
                    kelly_fraction: settings.kelly_fraction,
                    max_bankroll_pct_per_trade: settings.max_bankroll_pct_per_trade,
                    max_contracts_per_trade: settings.max_contracts_per_trade,
                },
                bankroll_cents,
                max_trade_size_cents: settings.max_trade_size_cents,
            }),
            Err(e) => {
                warn!(error = %e, "Balance fetch failed; falling back to flat sizing");
                None
            }
        },
        _ => None,
    };

    if let Some(cache) = cache {
        let mut cities = settings.active_cities.clone();
        cities.sort();

        for city in cities {
            summary.cities_scanned += 1;
            let signals =
                match scan_city(config, db, cache, city, sizing.as_ref(), now).await {
                    Ok(signals) => signals,
                    Err(e) => {
                        warn!(city = %city, error = %e, "City scan failed");
                        continue;
                    }
                };
            summary.signals_found += signals.len() as u32;

            for signal in &signals {
                let verdict = risk.check_trade(signal, now)?;
                if !verdict.is_approved() {
                    info!(
                        city = %city,
                        bracket = %signal.bracket,
                        reason = verdict.reason(),
                        "Signal blocked"
                    );
                    summary.trades_blocked += 1;
                    continue;
                }

                if !risk.check_and_reserve_exposure(signal.total_cost_cents(), now)? {
                    summary.trades_blocked += 1;
                    continue;
                }

                match settings.trading_mode {
                    TradingMode::Auto => {
                        let Some(client) = client else {
                            warn!("Auto mode without exchange credentials; queueing instead");
                            queue_trade(db, signal, USER_ID, now)?;
                            summary.trades_queued += 1;
                            continue;
                        };
                        match execute_trade(signal, client, db, USER_ID, now).await {
                            Ok(trade) => {
                                summary.trades_executed += 1;
                                info!(trade_id = %trade.id, "Auto-executed signal");
                            }
                            Err(e) => {
                                warn!(city = %city, error = %e, "Trade execution failed");
                            }
                        }
                    }
                    TradingMode::Manual => {
                        queue_trade(db, signal, USER_ID, now)?;
                        summary.trades_queued += 1;
                    }
                }
            }
        }
    } else {
        warn!("No price cache this cycle; skipping market scans");
    }

    // User-approved queue entries get executed here in manual mode.
    if let Some(client) = client {
        for pending in db.list_pending_by_status(PendingTradeStatus::Approved)? {
            let signal = TradeSignal {
                city: pending.city,
                bracket: pending.bracket_label.clone(),
                side: pending.side,
                price_cents: pending.price_cents,
                quantity: pending.quantity,
                model_probability: pending.model_probability,
                market_probability: pending.market_probability,
                ev: pending.ev,
                confidence: pending.confidence,
                market_ticker: pending.market_ticker.clone(),
                reasoning: pending.reasoning.clone(),
            };
            match execute_trade(&signal, client, db, USER_ID, now).await {
                Ok(_) => {
                    mark_executed(db, &pending.id, now)?;
                    summary.trades_executed += 1;
                }
                Err(e) => {
                    warn!(pending_id = %pending.id, error = %e, "Approved trade failed to execute");
                }
            }
        }
    }

    // Settlement sweep: adjudicate OPEN trades against recorded outcomes.
    let outcomes = settle_open_trades(db, settings, USER_ID, now)?;
    summary.trades_settled = outcomes.len() as u32;
    for outcome in &outcomes {
        info!(trade_id = %outcome.trade_id, pnl_cents = outcome.pnl_cents, "{}", outcome.narrative);
    }

    // Pending-trade TTL sweep.
    summary.pending_expired = expire_stale_trades(db, now)?;

    Ok(summary)
}

/// Scan one city: load its forecasts, read cached prices, derive bracket
/// definitions from the cached labels, run the prediction pipeline, and
/// hand the result to the EV scanner.
async fn scan_city(
    config: &Config,
    db: &Database,
    cache: &mut PriceCache,
    city: City,
    sizing: Option<&SizingContext>,
    now: chrono::DateTime<Utc>,
) -> Result<Vec<TradeSignal>> {
    let today = trading_day_for(now);

    let forecasts = db.get_forecasts(city, today)?;
    if forecasts.is_empty() {
        info!(city = %city, "No forecasts for today; skipping");
        return Ok(Vec::new());
    }

    let Some((prices, tickers)) = cache
        .get_city_prices(city, &date_str_yymmdd(today))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?
    else {
        info!(city = %city, "No cached market prices; skipping");
        return Ok(Vec::new());
    };

    // Bracket definitions come from the cached market labels, parsed once.
    let mut bracket_defs: Vec<BracketDef> = Vec::with_capacity(prices.len());
    for label in prices.keys() {
        let bounds = BracketBounds::parse(label)
            .with_context(|| format!("bad bracket label in cache: '{}'", label))?;
        let (lower, upper) = match bounds {
            BracketBounds::Below { upper } => (None, Some(upper)),
            BracketBounds::Range { lower, upper } => (Some(lower), Some(upper)),
            BracketBounds::Above { lower } => (Some(lower), None),
        };
        bracket_defs.push(BracketDef {
            label: label.clone(),
            lower_bound_f: lower,
            upper_bound_f: upper,
        });
    }
    bracket_defs.sort_by(|a, b| {
        a.lower_bound_f
            .unwrap_or(f64::MIN)
            .partial_cmp(&b.lower_bound_f.unwrap_or(f64::MIN))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    // Brackets are contiguous on the temperature line: a label like
    // "53-54F" covers everything up to the next bracket's floor, so the
    // CDF upper bound is the neighbor's lower bound, not the label's.
    for i in 0..bracket_defs.len().saturating_sub(1) {
        if let Some(next_lower) = bracket_defs[i + 1].lower_bound_f {
            if bracket_defs[i].upper_bound_f.is_some() {
                bracket_defs[i].upper_bound_f = Some(next_lower);
            }
        }
    }

    let prediction = generate_prediction(
        db,
        city,
        today,
        &forecasts,
        &bracket_defs,
        None,
        config.xgb_ensemble_weight,
        now,
    )
    .map_err(|e| anyhow::anyhow!("{}", e))?;

    // Defensive gates: stale or malformed data yields zero signals.
    if !validate_predictions(std::slice::from_ref(&prediction), now) {
        return Ok(Vec::new());
    }
    if !validate_market_prices(&prices) {
        return Ok(Vec::new());
    }

    Ok(scan_all_brackets(
        &prediction,
        &prices,
        &tickers,
        config.settings.min_ev_threshold,
        sizing,
    ))
}
