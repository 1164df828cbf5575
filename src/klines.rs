use crate::candle::{CandleRecord, value_as_f64};
use anyhow::{Result, anyhow};
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound Binance accepts for `limit` on /api/v3/klines.
pub const MAX_KLINE_LIMIT: u32 = 1000;

const KLINE_KEYS: &[&str] = &["openTime", "open", "high", "low", "close", "volume"];

/// Anything that can return the most recent `limit` candles for a market.
pub trait KlineSource {
    fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<CandleRecord>>> + Send;
}

pub struct BinanceRestClient {
    client: Client,
    url: String,
}

impl BinanceRestClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl KlineSource for BinanceRestClient {
    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<CandleRecord>> {
        if limit > MAX_KLINE_LIMIT {
            warn!(requested = limit, max = MAX_KLINE_LIMIT, "kline limit capped");
        }
        let limit = limit.min(MAX_KLINE_LIMIT);
        let query = [
            ("symbol", symbol.to_uppercase()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];

        debug!(url = %self.url, symbol, interval, limit, "requesting klines");
        let raw_klines: Vec<Vec<Value>> = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        raw_klines.iter().map(|k| parse_raw_kline(k)).collect()
    }
}

/// Maps one positional kline array (openTime, open, high, low, close, volume, ...).
pub fn parse_raw_kline(raw: &[Value]) -> Result<CandleRecord> {
    if raw.len() < KLINE_KEYS.len() {
        return Err(anyhow!("kline has {} fields, expected at least {}", raw.len(), KLINE_KEYS.len()));
    }

    let open_time = raw[0]
        .as_i64()
        .ok_or_else(|| anyhow!("kline field {} is not an integer: {}", KLINE_KEYS[0], raw[0]))?;

    let mut prices = [0.0_f64; 5];
    for (slot, (key, value)) in prices.iter_mut().zip(KLINE_KEYS[1..].iter().zip(&raw[1..])) {
        *slot = value_as_f64(value).ok_or_else(|| anyhow!("kline field {} is not numeric: {}", key, value))?;
    }
    let [open, high, low, close, volume] = prices;

    CandleRecord::from_open_time_ms(open_time, open, high, low, close, volume)
        .ok_or_else(|| anyhow!("kline open time out of range: {}", open_time))
}
