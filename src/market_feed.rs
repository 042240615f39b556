use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::auth::ExchangeAuth;
use crate::config::Config;
use crate::domain::City;
use crate::errors::TradingResult;
use crate::kalshi_client::{KalshiClient, KalshiMarket};
use crate::kalshi_ws::{KalshiWebSocket, DEMO_WS_URL};
use crate::markets::{bracket_label_from_strikes, build_event_ticker, date_str_yymmdd};
use crate::price_cache::PriceCache;
use crate::risk::trading_day_for;

pub const MAX_BACKOFF_SECONDS: u64 = 60;
pub const NO_CREDENTIALS_WAIT: Duration = Duration::from_secs(60);

/// Where a subscribed ticker's updates land in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerBracket {
    pub city: City,
    pub date_str: String,
    pub label: String,
}

/// Consumes exchange WebSocket ticker updates and keeps the Redis price
/// cache warm.
///
/// Lifecycle per connection:
///   1. discover today's and tomorrow's markets over REST,
///   2. subscribe the WebSocket to every discovered ticker,
///   3. translate each ticker update into a cache write + fan-out event,
///   4. refresh the subscription set on an interval,
///   5. on any failure, mark the feed down and reconnect with backoff.
pub struct MarketFeedConsumer {
    client: KalshiClient,
    ws: KalshiWebSocket,
    cache: PriceCache,
    active_cities: Vec<City>,
    refresh_interval: Duration,
    subscribed: HashSet<String>,
    ticker_map: HashMap<String, TickerBracket>,
    reconnects: u64,
}

impl MarketFeedConsumer {
    pub fn new(
        client: KalshiClient,
        ws: KalshiWebSocket,
        cache: PriceCache,
        active_cities: Vec<City>,
        refresh_interval: Duration,
    ) -> Self {
        MarketFeedConsumer {
            client,
            ws,
            cache,
            active_cities,
            refresh_interval,
            subscribed: HashSet::new(),
            ticker_map: HashMap::new(),
            reconnects: 0,
        }
    }

    /// Connect, subscribe, and process messages until the task is aborted.
    /// Any error marks the feed disconnected and retries with backoff.
    pub async fn run(&mut self) {
        let mut consecutive_failures: u32 = 0;

        loop {
            match self.run_connection().await {
                Ok(()) => {
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.reconnects += 1;
                    if let Err(cache_err) = self.cache.set_feed_status(false).await {
                        warn!(error = %cache_err, "Failed to flag feed as disconnected");
                    }

                    let wait = backoff_seconds(consecutive_failures);
                    warn!(
                        error = %e,
                        wait_seconds = wait,
                        reconnects = self.reconnects,
                        "Market feed error, reconnecting"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
            }
        }
    }

    async fn run_connection(&mut self) -> TradingResult<()> {
        self.ws.connect().await?;
        self.cache.set_feed_status(true).await?;
        self.refresh_subscriptions().await;

        let mut last_refresh = Instant::now();
        loop {
            let message = self.ws.next_message().await?;
            self.process_message(&message).await;

            if last_refresh.elapsed() >= self.refresh_interval {
                self.refresh_subscriptions().await;
                last_refresh = Instant::now();
            }
        }
    }

    /// Diff the desired ticker set against current subscriptions:
    /// subscribe to new markets, forget ones no longer listed.
    async fn refresh_subscriptions(&mut self) {
        let desired = self.discover_tickers().await;

        let expired: Vec<String> = self
            .subscribed
            .iter()
            .filter(|t| !desired.contains_key(*t))
            .cloned()
            .collect();
        for ticker in &expired {
            self.subscribed.remove(ticker);
            self.ticker_map.remove(ticker);
            self.ws.forget_subscription(ticker);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Unsubscribed expired tickers");
        }

        let mut new_count = 0usize;
        let mut new_tickers: Vec<&String> = desired
            .keys()
            .filter(|t| !self.subscribed.contains(*t))
            .collect();
        new_tickers.sort();
        for ticker in new_tickers {
            match self.ws.subscribe_ticker(ticker).await {
                Ok(()) => {
                    self.subscribed.insert(ticker.clone());
                    new_count += 1;
                }
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "Failed to subscribe ticker");
                }
            }
        }
        self.ticker_map.extend(desired);

        info!(
            new = new_count,
            total = self.subscribed.len(),
            "Subscribed to market tickers"
        );
    }

    /// REST discovery: today's and tomorrow's events for every active
    /// city, one market list per event.
    async fn discover_tickers(&mut self) -> HashMap<String, TickerBracket> {
        let mut desired = HashMap::new();
        let today = trading_day_for(Utc::now());
        let dates = [today, today + chrono::Duration::days(1)];

        for &city in &self.active_cities {
            for date in dates {
                let event_ticker = build_event_ticker(city, date);
                match self.client.get_event_markets(&event_ticker).await {
                    Ok(markets) => {
                        collect_market_brackets(
                            &mut desired,
                            city,
                            &date_str_yymmdd(date),
                            &markets,
                        );
                    }
                    Err(e) => {
                        warn!(
                            city = %city,
                            date = %date,
                            error = %e,
                            "Failed to discover tickers for event"
                        );
                    }
                }
            }
        }
        desired
    }

    async fn process_message(&mut self, message: &serde_json::Value) {
        match message.get("type").and_then(|t| t.as_str()) {
            Some("ticker") => self.handle_ticker_update(message).await,
            Some("error") => {
                warn!(message = %message, "Exchange WebSocket error message");
            }
            // Subscription confirmations, orderbook deltas, heartbeats.
            _ => {}
        }
    }

    /// A ticker update overwrites one bracket's price in the cache and
    /// publishes a fan-out event. Unknown tickers are ignored; cache
    /// failures are logged and swallowed so the feed never dies on them.
    async fn handle_ticker_update(&mut self, message: &serde_json::Value) {
        let msg = message.get("msg").cloned().unwrap_or_default();
        let Some(market_ticker) = msg.get("market_ticker").and_then(|t| t.as_str()) else {
            return;
        };
        let Some(bracket) = self.ticker_map.get(market_ticker).cloned() else {
            return;
        };

        let yes_price = msg
            .get("yes_price")
            .and_then(|p| p.as_i64())
            .or_else(|| msg.get("last_price").and_then(|p| p.as_i64()))
            .unwrap_or(0);

        let result = async {
            let (mut prices, mut tickers) = self
                .cache
                .get_city_prices(bracket.city, &bracket.date_str)
                .await?
                .unwrap_or_default();

            prices.insert(bracket.label.clone(), yes_price);
            tickers.insert(bracket.label.clone(), market_ticker.to_string());

            self.cache
                .set_city_prices(bracket.city, &bracket.date_str, &prices, &tickers)
                .await?;

            self.cache
                .publish_event(
                    "market.price_update",
                    serde_json::json!({
                        "city": bracket.city.as_str(),
                        "bracket": bracket.label,
                        "ticker": market_ticker,
                        "yes_price": yes_price,
                    }),
                )
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(ticker = market_ticker, error = %e, "Failed to cache ticker update");
        }
    }
}

/// Map each market with parseable strikes to its (city, date, label).
pub fn collect_market_brackets(
    into: &mut HashMap<String, TickerBracket>,
    city: City,
    date_str: &str,
    markets: &[KalshiMarket],
) {
    for market in markets {
        let Some(label) = bracket_label_from_strikes(market.floor_strike, market.cap_strike)
        else {
            continue;
        };
        into.insert(
            market.ticker.clone(),
            TickerBracket {
                city,
                date_str: date_str.to_string(),
                label,
            },
        );
    }
}

fn backoff_seconds(consecutive_failures: u32) -> u64 {
    2u64.saturating_pow(consecutive_failures.min(6)).min(MAX_BACKOFF_SECONDS)
}

/// Top-level entry point for the feed background task.
///
/// Missing credentials are not fatal: the user may not have onboarded
/// yet, so the task sleeps and rechecks instead of exiting.
pub async fn run_market_feed(config: Config) {
    loop {
        if !config.has_credentials() {
            info!(
                wait_seconds = NO_CREDENTIALS_WAIT.as_secs(),
                "No exchange credentials configured, retrying"
            );
            tokio::time::sleep(NO_CREDENTIALS_WAIT).await;
            continue;
        }

        let pem = match std::fs::read_to_string(&config.kalshi_private_key_path) {
            Ok(pem) => pem,
            Err(e) => {
                warn!(error = %e, "Failed to read private key file, retrying");
                tokio::time::sleep(NO_CREDENTIALS_WAIT).await;
                continue;
            }
        };

        let feed = async {
            let rest_auth = ExchangeAuth::new(&config.kalshi_api_key_id, &pem)?;
            let ws_auth = ExchangeAuth::new(&config.kalshi_api_key_id, &pem)?;
            let client =
                KalshiClient::new(rest_auth, config.settings.demo_mode, config.request_timeout_secs)?;
            let ws_url = if config.settings.demo_mode {
                Some(DEMO_WS_URL)
            } else {
                None
            };
            let ws = KalshiWebSocket::new(ws_auth, ws_url);
            let cache =
                PriceCache::connect(&config.redis_url, config.kalshi_ws_cache_ttl_seconds).await?;

            let mut consumer = MarketFeedConsumer::new(
                client,
                ws,
                cache,
                config.settings.active_cities.clone(),
                Duration::from_secs(config.kalshi_ws_refresh_minutes * 60),
            );
            consumer.run().await;
            Ok::<(), crate::errors::TradingError>(())
        }
        .await;

        if let Err(e) = feed {
            warn!(error = %e, "Market feed setup failed, retrying");
            tokio::time::sleep(NO_CREDENTIALS_WAIT).await;
        }
    }
}
