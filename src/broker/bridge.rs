// =============================================================================
// Terminal Bridge Client — HMAC-SHA256 signed REST + tick WebSocket
// =============================================================================
//
// The broker terminal itself is opaque; a small bridge service in front of it
// exposes quotes, candles, positions, and order actions over HTTP, plus a
// tick stream over WebSocket. Every REST request is signed with
// HMAC-SHA256(secret, path + body + timestamp) so a bridge exposed on a LAN
// cannot be driven by strangers.
//
// SECURITY: the secret never appears in logs or serialized payloads.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, instrument, warn};

use crate::market_data::{Candle, Tick, Timeframe};
use crate::types::RetCode;

use super::{BrokerGateway, OrderAck, OrderRequest, PendingOrder, Position, SymbolInfo};

type HmacSha256 = Hmac<Sha256>;

/// Clock-drift allowance advertised with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Bridge client. `Clone` is cheap; the inner reqwest client pools
/// connections.
#[derive(Clone)]
pub struct BridgeBroker {
    base_url: String,
    ws_url: String,
    secret: String,
    client: reqwest::Client,
}

impl BridgeBroker {
    /// Create a new bridge client.
    ///
    /// * `base_url` — e.g. `http://127.0.0.1:6542`
    /// * `api_key`  — sent as a header on every request.
    /// * `secret`   — used exclusively for HMAC signing.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let ws_url = base_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key.into()) {
            default_headers.insert("X-BRIDGE-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BridgeBroker initialised");

        Self {
            base_url,
            ws_url,
            secret: secret.into(),
            client,
        }
    }

    /// HMAC-SHA256 hex signature of `payload`.
    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let sig = self.sign(&format!("{path}{ts}"));
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .header("X-BRIDGE-TS", ts.to_string())
            .header("X-BRIDGE-SIGN", sig)
            .header("X-BRIDGE-RECV", RECV_WINDOW.to_string())
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response for {path}"))?;
        if !status.is_success() {
            anyhow::bail!("bridge GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let raw = body.to_string();
        let sig = self.sign(&format!("{path}{raw}{ts}"));
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("X-BRIDGE-TS", ts.to_string())
            .header("X-BRIDGE-SIGN", sig)
            .header("X-BRIDGE-RECV", RECV_WINDOW.to_string())
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response for {path}"))?;
        if !status.is_success() {
            anyhow::bail!("bridge POST {path} returned {status}: {body}");
        }
        Ok(body)
    }
}

/// Fold a bridge retcode string into the normalized category.
pub fn parse_retcode(value: &serde_json::Value) -> RetCode {
    let code = value
        .get("retcode")
        .and_then(|v| v.as_str())
        .unwrap_or("REJECTED");
    match code {
        "OK" | "DONE" | "PLACED" => RetCode::Ok,
        "REQUOTE" | "BUSY" | "CONNECTION" | "TRANSIENT" | "PRICE_OFF" => RetCode::Transient,
        "TIMEOUT" => RetCode::Timeout,
        other => {
            let reason = value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or(other);
            RetCode::Rejected(reason.to_string())
        }
    }
}

fn parse_tick(value: &serde_json::Value) -> Option<Tick> {
    Some(Tick {
        symbol: value.get("symbol")?.as_str()?.to_uppercase(),
        epoch_ms: value.get("epoch_ms")?.as_i64()?,
        bid: value.get("bid")?.as_f64()?,
        ask: value.get("ask")?.as_f64()?,
        last: value.get("last").and_then(|v| v.as_f64()),
        volume: value.get("volume").and_then(|v| v.as_f64()),
    })
}

fn parse_candle(value: &serde_json::Value) -> Option<Candle> {
    Some(Candle {
        open_time_ms: value.get("open_time_ms")?.as_i64()?,
        open: value.get("open")?.as_f64()?,
        high: value.get("high")?.as_f64()?,
        low: value.get("low")?.as_f64()?,
        close: value.get("close")?.as_f64()?,
        volume: value.get("volume").and_then(|v| v.as_f64()).unwrap_or(0.0),
        complete: value.get("complete").and_then(|v| v.as_bool()).unwrap_or(true),
    })
}

#[async_trait]
impl BrokerGateway for BridgeBroker {
    async fn subscribe_ticks(&self, symbols: &[String]) -> Result<mpsc::Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(4096);
        let url = format!(
            "{}/api/v1/ticks?symbols={}",
            self.ws_url,
            symbols.join(",").to_lowercase()
        );

        tokio::spawn(async move {
            loop {
                match connect_async(&url).await {
                    Ok((ws_stream, _response)) => {
                        info!(url = %url, "tick WebSocket connected");
                        let (_write, mut read) = ws_stream.split();
                        while let Some(message) = read.next().await {
                            match message {
                                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                                    match serde_json::from_str::<serde_json::Value>(&text) {
                                        Ok(value) => {
                                            if let Some(tick) = parse_tick(&value) {
                                                if tx.send(tick).await.is_err() {
                                                    // Engine side gone; stop for good.
                                                    return;
                                                }
                                            }
                                        }
                                        Err(e) => {
                                            warn!(error = %e, "unparseable tick message");
                                        }
                                    }
                                }
                                Ok(_) => {
                                    // Ping/pong/binary frames are handled by tungstenite.
                                }
                                Err(e) => {
                                    error!(error = %e, "tick WebSocket read error");
                                    break;
                                }
                            }
                        }
                        warn!("tick WebSocket stream ended — reconnecting in 5s");
                    }
                    Err(e) => {
                        error!(error = %e, "tick WebSocket connect failed — retrying in 5s");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        Ok(rx)
    }

    #[instrument(skip(self), name = "bridge::fetch_candles")]
    async fn fetch_candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let body = self
            .get_json(&format!(
                "/api/v1/candles?symbol={symbol}&timeframe={tf}&count={count}"
            ))
            .await?;
        let list = body
            .get("candles")
            .and_then(|v| v.as_array())
            .context("candles response missing 'candles' array")?;
        Ok(list.iter().filter_map(parse_candle).collect())
    }

    #[instrument(skip(self), name = "bridge::list_positions")]
    async fn list_positions(&self) -> Result<Vec<Position>> {
        let body = self.get_json("/api/v1/positions").await?;
        let list = body
            .get("positions")
            .and_then(|v| v.as_array())
            .context("positions response missing 'positions' array")?;
        let positions = list
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        Ok(positions)
    }

    #[instrument(skip(self), name = "bridge::list_pending_orders")]
    async fn list_pending_orders(&self) -> Result<Vec<PendingOrder>> {
        let body = self.get_json("/api/v1/orders").await?;
        let list = body
            .get("orders")
            .and_then(|v| v.as_array())
            .context("orders response missing 'orders' array")?;
        let orders = list
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        Ok(orders)
    }

    #[instrument(skip(self, request), name = "bridge::place_order")]
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let body = serde_json::json!({
            "symbol": request.symbol,
            "side": request.side.to_string(),
            "order_type": request.order_type.to_string(),
            "entry": request.entry,
            "sl": request.sl,
            "tp": request.tp,
            "volume": request.volume,
            "comment": request.comment,
            "type_time": request.type_time,
            "magic": request.magic,
        });
        let resp = self.post_json("/api/v1/order", &body).await?;
        Ok(OrderAck {
            ticket: resp.get("ticket").and_then(|v| v.as_u64()).unwrap_or(0),
            retcode: parse_retcode(&resp),
            fill_price: resp.get("fill_price").and_then(|v| v.as_f64()),
        })
    }

    #[instrument(skip(self), name = "bridge::modify_position")]
    async fn modify_position(
        &self,
        ticket: u64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> Result<RetCode> {
        let body = serde_json::json!({ "sl": sl, "tp": tp, "type_time": "GTC" });
        let resp = self
            .post_json(&format!("/api/v1/position/{ticket}/modify"), &body)
            .await?;
        Ok(parse_retcode(&resp))
    }

    #[instrument(skip(self), name = "bridge::close_position")]
    async fn close_position(
        &self,
        ticket: u64,
        volume: Option<f64>,
        comment: &str,
    ) -> Result<RetCode> {
        let body = serde_json::json!({
            "volume": volume,
            "comment": comment,
            "type_time": "GTC",
        });
        let resp = self
            .post_json(&format!("/api/v1/position/{ticket}/close"), &body)
            .await?;
        Ok(parse_retcode(&resp))
    }

    #[instrument(skip(self), name = "bridge::cancel_order")]
    async fn cancel_order(&self, ticket: u64) -> Result<RetCode> {
        let resp = self
            .post_json(
                &format!("/api/v1/order/{ticket}/cancel"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(parse_retcode(&resp))
    }

    #[instrument(skip(self), name = "bridge::symbol_info")]
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let body = self.get_json(&format!("/api/v1/symbols/{symbol}")).await?;
        serde_json::from_value(body).context("failed to parse symbol info")
    }

    #[instrument(skip(self), name = "bridge::current_quote")]
    async fn current_quote(&self, symbol: &str) -> Result<Tick> {
        let body = self.get_json(&format!("/api/v1/quotes/{symbol}")).await?;
        parse_tick(&body).context("failed to parse quote")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retcode_mapping() {
        assert_eq!(parse_retcode(&serde_json::json!({"retcode": "OK"})), RetCode::Ok);
        assert_eq!(
            parse_retcode(&serde_json::json!({"retcode": "REQUOTE"})),
            RetCode::Transient
        );
        assert_eq!(
            parse_retcode(&serde_json::json!({"retcode": "TIMEOUT"})),
            RetCode::Timeout
        );
        assert_eq!(
            parse_retcode(&serde_json::json!({"retcode": "NO_MONEY", "reason": "not enough margin"})),
            RetCode::Rejected("not enough margin".into())
        );
        // Missing retcode defaults to a rejection, never to success.
        assert!(matches!(
            parse_retcode(&serde_json::json!({})),
            RetCode::Rejected(_)
        ));
    }

    #[test]
    fn tick_parsing() {
        let value = serde_json::json!({
            "symbol": "xauusd",
            "epoch_ms": 1_700_000_000_000_i64,
            "bid": 2449.8,
            "ask": 2450.2,
            "volume": 3.0,
        });
        let tick = parse_tick(&value).unwrap();
        assert_eq!(tick.symbol, "XAUUSD");
        assert_eq!(tick.last, None);
        assert_eq!(tick.volume, Some(3.0));
    }

    #[test]
    fn candle_parsing_defaults() {
        let value = serde_json::json!({
            "open_time_ms": 60_000,
            "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5,
        });
        let candle = parse_candle(&value).unwrap();
        assert!(candle.complete);
        assert_eq!(candle.volume, 0.0);
    }

    #[test]
    fn signature_is_deterministic() {
        let broker = BridgeBroker::new("http://127.0.0.1:6542", "key", "secret");
        let a = broker.sign("/api/v1/positions1700000000000");
        let b = broker.sign("/api/v1/positions1700000000000");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let c = broker.sign("/api/v1/positions1700000000001");
        assert_ne!(a, c);
    }

    #[test]
    fn ws_url_derived_from_base() {
        let broker = BridgeBroker::new("https://bridge.local:6542/", "k", "s");
        assert_eq!(broker.ws_url, "wss://bridge.local:6542");
        assert_eq!(broker.base_url, "https://bridge.local:6542");
    }
}
