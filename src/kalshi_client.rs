use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::auth::ExchangeAuth;
use crate::domain::{City, Side};
use crate::errors::{ErrorContext, TradingError, TradingResult};
use crate::markets::series_ticker;
use crate::rate_limiter::TokenBucket;

pub const PROD_BASE_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";
pub const DEMO_BASE_URL: &str = "https://demo-api.kalshi.co/trade-api/v2";

/// Path prefix the exchange expects inside the signing string, present
/// even though the base URL already carries it.
const SIGNING_PREFIX: &str = "/trade-api/v2";

// ─── API models ───

#[derive(Debug, Clone, Deserialize)]
pub struct KalshiEvent {
    pub event_ticker: String,
    #[serde(default)]
    pub series_ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub status: String,
}

/// One bracket market. Edge brackets have a single null strike:
/// bottom edge has no floor, top edge no cap.
#[derive(Debug, Clone, Deserialize)]
pub struct KalshiMarket {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub yes_bid: i64,
    #[serde(default)]
    pub yes_ask: i64,
    #[serde(default)]
    pub no_bid: i64,
    #[serde(default)]
    pub no_ask: i64,
    #[serde(default)]
    pub last_price: i64,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub open_interest: i64,
    pub floor_strike: Option<f64>,
    pub cap_strike: Option<f64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
}

/// Orderbook levels as [price_cents, quantity] pairs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KalshiOrderbook {
    #[serde(default)]
    pub yes: Vec<[i64; 2]>,
    #[serde(default)]
    pub no: Vec<[i64; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// An order ready for POST /portfolio/orders. Validated before any
/// network call.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub action: OrderAction,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub count: i64,
    pub yes_price: i64,
}

impl OrderRequest {
    /// Pre-flight validation: non-empty ticker, count >= 1, price in [1, 99].
    pub fn validate(&self) -> TradingResult<()> {
        if self.ticker.trim().is_empty() {
            return Err(TradingError::input("ticker must be a non-empty string"));
        }
        if self.count < 1 {
            return Err(TradingError::input(format!(
                "count must be >= 1, got {}",
                self.count
            )));
        }
        crate::domain::validate_price_cents(self.yes_price)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub yes_price: i64,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KalshiPosition {
    pub ticker: String,
    #[serde(default)]
    pub market_exposure: i64,
    #[serde(default)]
    pub resting_orders_count: i64,
    #[serde(default)]
    pub total_traded: i64,
    #[serde(default)]
    pub realized_pnl: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KalshiSettlement {
    pub ticker: String,
    #[serde(default)]
    pub market_result: String,
    #[serde(default)]
    pub revenue: i64,
    #[serde(default)]
    pub settled_time: Option<DateTime<Utc>>,
}

/// A filled order from the authoritative exchange-side fill list.
#[derive(Debug, Clone, Deserialize)]
pub struct KalshiFill {
    pub order_id: String,
    pub ticker: String,
    pub side: Side,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub yes_price: i64,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
}

// ─── Client ───

/// Authenticated, rate-limited exchange REST client.
///
/// Every request is signed, throttled through the token bucket, and
/// non-2xx responses are mapped into the closed error taxonomy.
pub struct KalshiClient {
    client: Client,
    base_url: String,
    auth: ExchangeAuth,
    limiter: TokenBucket,
}

impl KalshiClient {
    pub fn new(auth: ExchangeAuth, demo: bool, timeout_secs: u64) -> TradingResult<Self> {
        let base = if demo { DEMO_BASE_URL } else { PROD_BASE_URL };
        let client = Self::with_base_url(auth, base, timeout_secs)?;
        info!(demo, base_url = base, "Exchange client initialized");
        Ok(client)
    }

    pub fn with_base_url(
        auth: ExchangeAuth,
        base_url: &str,
        timeout_secs: u64,
    ) -> TradingResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(TradingError::connection)?;
        Ok(KalshiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            limiter: TokenBucket::default(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> TradingResult<serde_json::Value> {
        self.limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let signing_path = format!("{}{}", SIGNING_PREFIX, path);
        let headers = self.auth.sign_request(method.as_str(), &signing_path)?;

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(json) = body {
            request = request.json(json);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TradingError::Connection(format!("network error: {}", e)))?;

        let status = response.status().as_u16();

        if status == 401 {
            return Err(TradingError::AuthFailure {
                message: "Authentication failed".to_string(),
                context: ErrorContext::new().with("path", path),
            });
        }

        if status == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            return Err(TradingError::RateLimited { retry_after });
        }

        if status == 400 && path.contains("/portfolio/orders") {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| "Order rejected".to_string());
            return Err(TradingError::OrderRejected {
                message,
                context: ErrorContext::new().with("path", path),
            });
        }

        if status >= 400 {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| format!("API error {}", status));
            return Err(TradingError::Api { status, message });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TradingError::Connection(format!("failed to parse response: {}", e)))
    }

    // ─── Account ───

    /// Account balance in cents, as the exchange reports it.
    pub async fn get_balance_cents(&self) -> TradingResult<i64> {
        let data = self
            .request(Method::GET, "/portfolio/balance", &[], None)
            .await?;
        data.get("balance")
            .and_then(|b| b.as_i64())
            .ok_or_else(|| TradingError::Api {
                status: 200,
                message: "balance missing from response".to_string(),
            })
    }

    // ─── Events & markets ───

    /// Active weather events, optionally filtered to one city's series.
    pub async fn get_weather_events(&self, city: Option<City>) -> TradingResult<Vec<KalshiEvent>> {
        let mut query = Vec::new();
        if let Some(city) = city {
            query.push(("series_ticker", series_ticker(city).to_string()));
        }
        let data = self.request(Method::GET, "/events", &query, None).await?;
        let events = parse_list(&data, "events")?;
        info!(city = ?city.map(|c| c.as_str()), count = events.len(), "Weather events fetched");
        Ok(events)
    }

    /// All bracket markets for one event (typically 6).
    pub async fn get_event_markets(&self, event_ticker: &str) -> TradingResult<Vec<KalshiMarket>> {
        let query = [
            ("event_ticker", event_ticker.to_string()),
            ("limit", "100".to_string()),
        ];
        let data = self.request(Method::GET, "/markets", &query, None).await?;
        let markets = parse_list(&data, "markets")?;
        info!(event_ticker, market_count = markets.len(), "Event markets fetched");
        Ok(markets)
    }

    pub async fn get_market(&self, ticker: &str) -> TradingResult<KalshiMarket> {
        let data = self
            .request(Method::GET, &format!("/markets/{}", ticker), &[], None)
            .await?;
        parse_object(&data, "market")
    }

    pub async fn get_orderbook(&self, ticker: &str) -> TradingResult<KalshiOrderbook> {
        let data = self
            .request(
                Method::GET,
                &format!("/markets/{}/orderbook", ticker),
                &[],
                None,
            )
            .await?;
        parse_object(&data, "orderbook")
    }

    // ─── Orders ───

    pub async fn place_order(&self, order: &OrderRequest) -> TradingResult<OrderResponse> {
        order.validate()?;

        let body = serde_json::to_value(order)
            .map_err(|e| TradingError::input(format!("unserializable order: {}", e)))?;
        let data = self
            .request(Method::POST, "/portfolio/orders", &[], Some(&body))
            .await?;
        let response: OrderResponse = parse_object(&data, "order")?;

        info!(
            order_id = %response.order_id,
            ticker = %order.ticker,
            side = %order.side,
            price_cents = order.yes_price,
            count = order.count,
            status = %response.status,
            "Order placed"
        );
        Ok(response)
    }

    pub async fn cancel_order(&self, order_id: &str) -> TradingResult<()> {
        self.request(
            Method::DELETE,
            &format!("/portfolio/orders/{}", order_id),
            &[],
            None,
        )
        .await?;
        info!(order_id, "Order cancelled");
        Ok(())
    }

    // ─── Positions, settlements, fills ───

    pub async fn get_positions(&self) -> TradingResult<Vec<KalshiPosition>> {
        let data = self
            .request(Method::GET, "/portfolio/positions", &[], None)
            .await?;
        parse_list(&data, "market_positions")
    }

    pub async fn get_settlements(&self, limit: u32) -> TradingResult<Vec<KalshiSettlement>> {
        let query = [("limit", limit.to_string())];
        let data = self
            .request(Method::GET, "/portfolio/settlements", &query, None)
            .await?;
        parse_list(&data, "settlements")
    }

    /// The authoritative filled-order list, used by reconciliation.
    pub async fn get_fills(&self) -> TradingResult<Vec<KalshiFill>> {
        let data = self
            .request(Method::GET, "/portfolio/fills", &[], None)
            .await?;
        parse_list(&data, "fills")
    }
}

fn parse_list<T: serde::de::DeserializeOwned>(
    data: &serde_json::Value,
    key: &str,
) -> TradingResult<Vec<T>> {
    let raw = data.get(key).cloned().unwrap_or(serde_json::Value::Null);
    if raw.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(raw).map_err(|e| TradingError::Api {
        status: 200,
        message: format!("malformed '{}' in response: {}", key, e),
    })
}

fn parse_object<T: serde::de::DeserializeOwned>(
    data: &serde_json::Value,
    key: &str,
) -> TradingResult<T> {
    let raw = data
        .get(key)
        .cloned()
        .ok_or_else(|| TradingError::Api {
            status: 200,
            message: format!("'{}' missing from response", key),
        })?;
    serde_json::from_value(raw).map_err(|e| TradingError::Api {
        status: 200,
        message: format!("malformed '{}' in response: {}", key, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::RsaPrivateKey;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> KalshiClient {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
        let auth = ExchangeAuth::new("test-key-id", &pem).unwrap();
        KalshiClient::with_base_url(auth, base_url, 5).unwrap()
    }

    fn sample_order() -> OrderRequest {
        OrderRequest {
            ticker: "KXHIGHNY-26FEB18-B3".to_string(),
            action: OrderAction::Buy,
            side: Side::Yes,
            order_type: OrderType::Limit,
            count: 1,
            yes_price: 22,
        }
    }

    #[tokio::test]
    async fn test_balance_fetch_sends_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/balance"))
            .and(header_exists("KALSHI-ACCESS-KEY"))
            .and(header_exists("KALSHI-ACCESS-SIGNATURE"))
            .and(header_exists("KALSHI-ACCESS-TIMESTAMP"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"balance": 50000})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let balance = client.get_balance_cents().await.unwrap();
        assert_eq!(balance, 50000);
    }

    #[tokio::test]
    async fn test_401_maps_to_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/balance"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.get_balance_cents().await.unwrap_err();
        assert!(matches!(err, TradingError::AuthFailure { .. }));
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn test_429_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/balance"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.get_balance_cents().await.unwrap_err();
        match err {
            TradingError::RateLimited { retry_after } => {
                assert_eq!(retry_after.as_deref(), Some("30"));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_rejection_parses_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/portfolio/orders"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"message": "insufficient balance"})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.place_order(&sample_order()).await.unwrap_err();
        match err {
            TradingError::OrderRejected { message, .. } => {
                assert_eq!(message, "insufficient balance");
            }
            other => panic!("expected OrderRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_4xx_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets/NOPE"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"message": "market not found"})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.get_market("NOPE").await.unwrap_err();
        match err {
            TradingError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "market not found");
            }
            other => panic!("expected Api, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_place_order_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/portfolio/orders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "order": {
                    "order_id": "ord-123",
                    "ticker": "KXHIGHNY-26FEB18-B3",
                    "status": "executed",
                    "count": 1,
                    "yes_price": 22
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let response = client.place_order(&sample_order()).await.unwrap();
        assert_eq!(response.order_id, "ord-123");
        assert_eq!(response.status, "executed");
        assert_eq!(response.count, 1);
    }

    #[tokio::test]
    async fn test_place_order_rejects_empty_ticker_locally() {
        // No mock server mounted: validation must fail before any request.
        let client = test_client("http://127.0.0.1:1");
        let mut order = sample_order();
        order.ticker = "  ".to_string();
        let err = client.place_order(&order).await.unwrap_err();
        assert!(matches!(err, TradingError::Input(_)));
    }

    #[tokio::test]
    async fn test_order_serialization_shape() {
        let order = sample_order();
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["ticker"], "KXHIGHNY-26FEB18-B3");
        assert_eq!(json["action"], "buy");
        assert_eq!(json["side"], "yes");
        assert_eq!(json["type"], "limit");
        assert_eq!(json["count"], 1);
        assert_eq!(json["yes_price"], 22);
    }

    #[tokio::test]
    async fn test_get_event_markets_parses_strikes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .and(query_param("event_ticker", "KXHIGHNY-26FEB18"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "markets": [
                    {"ticker": "KXHIGHNY-26FEB18-B1", "floor_strike": null, "cap_strike": 50.99},
                    {"ticker": "KXHIGHNY-26FEB18-B2", "floor_strike": 51.0, "cap_strike": 52.99}
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let markets = client.get_event_markets("KXHIGHNY-26FEB18").await.unwrap();
        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0].floor_strike, None);
        assert_eq!(markets[0].cap_strike, Some(50.99));
        assert_eq!(markets[1].floor_strike, Some(51.0));
    }

    #[tokio::test]
    async fn test_get_fills_parses_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/fills"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "fills": [
                    {"order_id": "o1", "ticker": "KXHIGHNY-26FEB18-B3", "side": "yes",
                     "action": "buy", "count": 2, "yes_price": 22}
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let fills = client.get_fills().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].side, Side::Yes);
        assert_eq!(fills[0].count, 2);
    }

    #[tokio::test]
    async fn test_missing_list_key_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let events = client.get_weather_events(Some(City::Nyc)).await.unwrap();
        assert!(events.is_empty());
    }
}
