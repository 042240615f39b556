use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::domain::City;
use crate::errors::{TradingError, TradingResult};

/// Pub/sub channel for UI fan-out events.
pub const EVENTS_CHANNEL: &str = "weather:events";
pub const FEED_STATUS_KEY: &str = "weather:feed:status";

/// The ticker map outlives prices so a price refresh can always resolve
/// its market, even when the price key has lapsed.
pub const MIN_TICKER_TTL_SECONDS: u64 = 300;

pub fn price_key(city: City, date_str: &str) -> String {
    format!("weather:prices:{}:{}", city.as_str(), date_str)
}

pub fn ticker_key(city: City, date_str: &str) -> String {
    format!("weather:tickers:{}:{}", city.as_str(), date_str)
}

/// Redis-backed per-(city, date) price and ticker cache.
///
/// Written only by the feed consumer; read by the trading cycle so it
/// never has to hit the exchange REST API for quotes.
#[derive(Clone)]
pub struct PriceCache {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl PriceCache {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> TradingResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| TradingError::Connection(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TradingError::Connection(format!("redis connect failed: {}", e)))?;
        Ok(PriceCache { conn, ttl_seconds })
    }

    /// Store the bracket->price and bracket->ticker maps for a city+date.
    ///
    /// Both keys are written in one pipelined round trip so readers never
    /// observe a price map without its ticker map.
    pub async fn set_city_prices(
        &mut self,
        city: City,
        date_str: &str,
        prices: &HashMap<String, i64>,
        tickers: &HashMap<String, String>,
    ) -> TradingResult<()> {
        let prices_json = serde_json::to_string(prices)
            .map_err(|e| TradingError::storage(format!("unserializable prices: {}", e)))?;
        let tickers_json = serde_json::to_string(tickers)
            .map_err(|e| TradingError::storage(format!("unserializable tickers: {}", e)))?;

        let ticker_ttl = self.ttl_seconds.max(MIN_TICKER_TTL_SECONDS);
        let mut pipe = redis::pipe();
        pipe.set_ex(price_key(city, date_str), prices_json, self.ttl_seconds)
            .ignore()
            .set_ex(ticker_key(city, date_str), tickers_json, ticker_ttl)
            .ignore();
        let _: () = pipe
            .query_async(&mut self.conn)
            .await
            .map_err(|e| TradingError::Connection(format!("redis write failed: {}", e)))?;

        debug!(
            city = %city,
            date = date_str,
            bracket_count = prices.len(),
            "Cached market prices"
        );
        Ok(())
    }

    /// Cached (prices, tickers) for a city+date, or None when either key
    /// has lapsed.
    #[allow(clippy::type_complexity)]
    pub async fn get_city_prices(
        &mut self,
        city: City,
        date_str: &str,
    ) -> TradingResult<Option<(HashMap<String, i64>, HashMap<String, String>)>> {
        let mut pipe = redis::pipe();
        pipe.get(price_key(city, date_str))
            .get(ticker_key(city, date_str));
        let (prices_raw, tickers_raw): (Option<String>, Option<String>) = pipe
            .query_async(&mut self.conn)
            .await
            .map_err(|e| TradingError::Connection(format!("redis read failed: {}", e)))?;

        let (Some(prices_raw), Some(tickers_raw)) = (prices_raw, tickers_raw) else {
            return Ok(None);
        };

        let prices = serde_json::from_str(&prices_raw)
            .map_err(|e| TradingError::storage(format!("corrupt price cache entry: {}", e)))?;
        let tickers = serde_json::from_str(&tickers_raw)
            .map_err(|e| TradingError::storage(format!("corrupt ticker cache entry: {}", e)))?;
        Ok(Some((prices, tickers)))
    }

    /// Flag the feed as connected ("1") or disconnected ("0").
    pub async fn set_feed_status(&mut self, connected: bool) -> TradingResult<()> {
        let _: () = self
            .conn
            .set(FEED_STATUS_KEY, if connected { "1" } else { "0" })
            .await
            .map_err(|e| TradingError::Connection(format!("redis write failed: {}", e)))?;
        Ok(())
    }

    /// True only when the feed has marked itself connected.
    pub async fn get_feed_status(&mut self) -> TradingResult<bool> {
        let value: Option<String> = self
            .conn
            .get(FEED_STATUS_KEY)
            .await
            .map_err(|e| TradingError::Connection(format!("redis read failed: {}", e)))?;
        Ok(value.as_deref() == Some("1"))
    }

    /// Publish a fan-out event for the UI on the events channel.
    pub async fn publish_event(
        &mut self,
        event_type: &str,
        data: serde_json::Value,
    ) -> TradingResult<()> {
        let payload = event_payload(event_type, data, chrono::Utc::now());
        let _: () = self
            .conn
            .publish(EVENTS_CHANNEL, payload.to_string())
            .await
            .map_err(|e| TradingError::Connection(format!("redis publish failed: {}", e)))?;
        Ok(())
    }
}

pub fn event_payload(
    event_type: &str,
    data: serde_json::Value,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "type": event_type,
        "timestamp": timestamp.to_rfc3339(),
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(price_key(City::Nyc, "260218"), "weather:prices:NYC:260218");
        assert_eq!(
            ticker_key(City::Aus, "260218"),
            "weather:tickers:AUS:260218"
        );
    }

    #[test]
    fn test_event_payload_shape() {
        let ts = chrono::Utc::now();
        let payload = event_payload(
            "market.price_update",
            serde_json::json!({"city": "NYC", "bracket": "53-54F", "yes_price": 23}),
            ts,
        );
        assert_eq!(payload["type"], "market.price_update");
        assert_eq!(payload["data"]["yes_price"], 23);
        assert_eq!(payload["timestamp"], serde_json::json!(ts.to_rfc3339()));
    }

    #[test]
    fn test_price_map_json_round_trip() {
        let mut prices = HashMap::new();
        prices.insert("53-54F".to_string(), 23i64);
        prices.insert("<=50F".to_string(), 4i64);
        let json = serde_json::to_string(&prices).unwrap();
        let back: HashMap<String, i64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prices);
    }
}
