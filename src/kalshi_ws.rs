use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::auth::ExchangeAuth;
use crate::errors::{TradingError, TradingResult};

pub const WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";
pub const DEMO_WS_URL: &str = "wss://demo-api.kalshi.com/trade-api/ws/v2";
/// The WebSocket handshake signs over this path, not any REST path.
pub const WS_AUTH_PATH: &str = "/trade-api/ws/v2";

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_RECONNECT_RETRIES: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ReadOutcome {
    Message(serde_json::Value),
    NeedReconnect,
    Nothing,
}

/// WebSocket client for real-time market data.
///
/// Handles the signed handshake, per-ticker subscriptions, a ping every
/// 10 s, a 30 s read timeout, and reconnection with 2^attempt backoff
/// (max 5 attempts) that replays all recorded subscriptions.
pub struct KalshiWebSocket {
    auth: ExchangeAuth,
    url: String,
    ws: Option<WsStream>,
    subscriptions: Vec<serde_json::Value>,
    msg_id: u64,
    last_ping: Instant,
}

impl KalshiWebSocket {
    pub fn new(auth: ExchangeAuth, url: Option<&str>) -> Self {
        KalshiWebSocket {
            auth,
            url: url.unwrap_or(WS_URL).to_string(),
            ws: None,
            subscriptions: Vec::new(),
            msg_id: 0,
            last_ping: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Establish the connection with signed auth headers on the handshake.
    pub async fn connect(&mut self) -> TradingResult<()> {
        let headers = self.auth.sign_request("GET", WS_AUTH_PATH)?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TradingError::Connection(format!("invalid WebSocket URL: {}", e)))?;
        let header_map = request.headers_mut();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TradingError::Connection(format!("bad header name: {}", e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TradingError::Connection(format!("bad header value: {}", e)))?;
            header_map.insert(name, value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| TradingError::Connection(format!("WebSocket connection failed: {}", e)))?;

        self.ws = Some(ws);
        self.last_ping = Instant::now();
        info!(url = %self.url, "WebSocket connected");
        Ok(())
    }

    /// Subscribe to ticker-level updates (last price, volume) for a market.
    pub async fn subscribe_ticker(&mut self, ticker: &str) -> TradingResult<()> {
        self.msg_id += 1;
        let frame = subscribe_frame(self.msg_id, "ticker", ticker);
        self.send_frame(&frame).await?;
        self.subscriptions.push(frame);
        info!(ticker, "Subscribed to ticker");
        Ok(())
    }

    /// Subscribe to orderbook delta updates for a market.
    pub async fn subscribe_orderbook(&mut self, ticker: &str) -> TradingResult<()> {
        self.msg_id += 1;
        let frame = subscribe_frame(self.msg_id, "orderbook_delta", ticker);
        self.send_frame(&frame).await?;
        self.subscriptions.push(frame);
        info!(ticker, "Subscribed to orderbook");
        Ok(())
    }

    /// Drop the recorded subscription for a ticker so it is not replayed
    /// on reconnect. The server forgets server-side state on disconnect.
    pub fn forget_subscription(&mut self, ticker: &str) {
        self.subscriptions.retain(|frame| {
            frame
                .pointer("/params/market_ticker")
                .and_then(|v| v.as_str())
                != Some(ticker)
        });
    }

    /// Next parsed JSON message from the feed.
    ///
    /// Sends a ping when the heartbeat interval has elapsed, treats a read
    /// blocked past the timeout as a dead connection, and transparently
    /// reconnects. Fails only when reconnection is exhausted.
    pub async fn next_message(&mut self) -> TradingResult<serde_json::Value> {
        loop {
            if self.ws.is_none() {
                self.reconnect().await?;
                continue;
            }

            if self.last_ping.elapsed() >= HEARTBEAT_INTERVAL {
                if let Some(ws) = self.ws.as_mut() {
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        warn!(error = %e, "Heartbeat ping failed");
                        self.ws = None;
                        continue;
                    }
                }
                self.last_ping = Instant::now();
            }

            let outcome = {
                let Some(ws) = self.ws.as_mut() else { continue };
                match tokio::time::timeout(READ_TIMEOUT, ws.next()).await {
                    Err(_) => {
                        warn!("WebSocket read timed out, reconnecting");
                        ReadOutcome::NeedReconnect
                    }
                    Ok(None) => {
                        warn!("WebSocket stream ended, reconnecting");
                        ReadOutcome::NeedReconnect
                    }
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "WebSocket read failed, reconnecting");
                        ReadOutcome::NeedReconnect
                    }
                    Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
                        Ok(value) => ReadOutcome::Message(value),
                        Err(e) => {
                            warn!(error = %e, "Unparseable WebSocket message");
                            ReadOutcome::Nothing
                        }
                    },
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                        ReadOutcome::Nothing
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        warn!("WebSocket closed by server, reconnecting");
                        ReadOutcome::NeedReconnect
                    }
                    Ok(Some(Ok(_))) => ReadOutcome::Nothing,
                }
            };

            match outcome {
                ReadOutcome::Message(value) => return Ok(value),
                ReadOutcome::NeedReconnect => self.reconnect().await?,
                ReadOutcome::Nothing => {}
            }
        }
    }

    /// Close cleanly: a close frame is sent before the stream is dropped.
    pub async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
        info!("WebSocket closed");
    }

    async fn send_frame(&mut self, frame: &serde_json::Value) -> TradingResult<()> {
        let ws = self.ws.as_mut().ok_or_else(|| {
            TradingError::Connection("cannot send message: WebSocket is not connected".to_string())
        })?;
        ws.send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| TradingError::Connection(format!("WebSocket send failed: {}", e)))
    }

    /// Exponential backoff reconnect; replays all recorded subscriptions.
    async fn reconnect(&mut self) -> TradingResult<()> {
        self.ws = None;

        for attempt in 0..MAX_RECONNECT_RETRIES {
            let wait = Duration::from_secs(2u64.pow(attempt));
            info!(
                attempt = attempt + 1,
                max_retries = MAX_RECONNECT_RETRIES,
                wait_seconds = wait.as_secs(),
                "Reconnect attempt"
            );
            tokio::time::sleep(wait).await;

            match self.connect().await {
                Ok(()) => {
                    let frames = self.subscriptions.clone();
                    let mut replay_ok = true;
                    for frame in &frames {
                        if let Err(e) = self.send_frame(frame).await {
                            warn!(error = %e, "Failed to replay subscription");
                            replay_ok = false;
                            break;
                        }
                    }
                    if replay_ok {
                        info!(
                            subscription_count = frames.len(),
                            "Reconnected and re-subscribed"
                        );
                        return Ok(());
                    }
                    self.ws = None;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                }
            }
        }

        Err(TradingError::Connection(format!(
            "WebSocket reconnection failed after {} attempts",
            MAX_RECONNECT_RETRIES
        )))
    }
}

fn subscribe_frame(id: u64, channel: &str, ticker: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "cmd": "subscribe",
        "params": {
            "channels": [channel],
            "market_ticker": ticker,
        }
    })
}
