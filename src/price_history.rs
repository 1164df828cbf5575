//! Daily close prices from Yahoo Finance, with a short-lived cache.

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum HistoryPeriod {
    #[serde(rename = "6mo")]
    #[value(name = "6mo")]
    SixMonths,
    #[serde(rename = "1y")]
    #[value(name = "1y")]
    OneYear,
    #[serde(rename = "2y")]
    #[value(name = "2y")]
    TwoYears,
    #[serde(rename = "5y")]
    #[value(name = "5y")]
    FiveYears,
}

impl HistoryPeriod {
    pub const ALL: [HistoryPeriod; 4] = [
        HistoryPeriod::SixMonths,
        HistoryPeriod::OneYear,
        HistoryPeriod::TwoYears,
        HistoryPeriod::FiveYears,
    ];

    /// The `range` query value Yahoo expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryPeriod::SixMonths => "6mo",
            HistoryPeriod::OneYear => "1y",
            HistoryPeriod::TwoYears => "2y",
            HistoryPeriod::FiveYears => "5y",
        }
    }

    fn index(&self) -> usize {
        Self::ALL.iter().position(|p| p == self).unwrap_or(0)
    }

    pub fn next(&self) -> Self {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }

    pub fn previous(&self) -> Self {
        Self::ALL[(self.index() + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl std::fmt::Display for HistoryPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

/// Ordered daily closes for one symbol. Never contains missing closes.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    pub symbol: String,
    pub points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn closes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.close).collect()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|p| p.date)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

pub trait PriceSource {
    fn fetch_close(&self, symbol: &str, period: HistoryPeriod) -> impl Future<Output = Result<PriceSeries>> + Send;
}

// --- Yahoo chart endpoint ---

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Deserialize, Debug)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Deserialize, Debug, Default)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Deserialize, Debug)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Deserialize, Debug)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

pub struct YahooClient {
    client: Client,
    base_url: String,
}

impl YahooClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        // Yahoo rejects requests without a browser-like user agent.
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) candle-forecast/0.1")
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl PriceSource for YahooClient {
    async fn fetch_close(&self, symbol: &str, period: HistoryPeriod) -> Result<PriceSeries> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), symbol);
        debug!(%url, %period, "requesting daily closes");

        let body = self
            .client
            .get(&url)
            .query(&[("range", period.as_str()), ("interval", "1d")])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_chart(symbol, &body)
    }
}

/// Extracts the close series, dropping days without a close.
fn parse_chart(symbol: &str, body: &str) -> Result<PriceSeries> {
    let response: ChartResponse = serde_json::from_str(body)?;
    if let Some(error) = response.chart.error.filter(|e| !e.is_null()) {
        return Err(anyhow!("chart API error: {}", error));
    }

    let points = response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .map(|result| {
            let closes = result.indicators.quote.into_iter().next().map(|q| q.close).unwrap_or_default();
            let offset = result.meta.gmtoffset;
            result
                .timestamp
                .iter()
                .zip(closes)
                .filter_map(|(ts, close)| {
                    let close = close.filter(|c| c.is_finite())?;
                    let date = DateTime::from_timestamp(ts + offset, 0)?.date_naive();
                    Some(PricePoint { date, close })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(PriceSeries {
        symbol: symbol.to_string(),
        points,
    })
}

// --- Cache ---

struct CachedSeries {
    series: PriceSeries,
    fetched_at: Instant,
}

/// Series keyed by (symbol, period), valid for `ttl` after they were fetched.
pub struct PriceCache {
    ttl: Duration,
    entries: HashMap<(String, HistoryPeriod), CachedSeries>,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, symbol: &str, period: HistoryPeriod, now: Instant) -> Option<&PriceSeries> {
        let entry = self.entries.get(&(symbol.to_string(), period))?;
        (now.saturating_duration_since(entry.fetched_at) < self.ttl).then_some(&entry.series)
    }

    /// Stores a fresh series and evicts every entry that has expired by `now`.
    pub fn insert(&mut self, period: HistoryPeriod, series: PriceSeries, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.fetched_at) < ttl);
        self.entries.insert(
            (series.symbol.clone(), period),
            CachedSeries {
                series,
                fetched_at: now,
            },
        );
    }
}
