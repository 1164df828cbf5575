//! One dashboard render cycle: validate, fetch (or reuse) closes, fit, forecast.

use crate::arima::{ArimaModel, ArimaOrder, ForecastStep, ModelError};
use crate::error::ForecastError;
use crate::price_history::{HistoryPeriod, PriceCache, PriceSeries, PriceSource};
use chrono::{Datelike, Days, NaiveDate, Weekday};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const MIN_HORIZON: usize = 3;
pub const MAX_HORIZON: usize = 14;

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRequest {
    pub symbol: String,
    pub period: HistoryPeriod,
    pub horizon: usize,
    pub order: ArimaOrder,
}

impl ForecastRequest {
    /// Returns the trimmed symbol when every input is within bounds.
    pub fn validate(&self) -> Result<&str, ForecastError> {
        let symbol = self.symbol.trim();
        if symbol.is_empty() {
            return Err(ForecastError::EmptySymbol);
        }
        if !(MIN_HORIZON..=MAX_HORIZON).contains(&self.horizon) {
            return Err(ForecastError::OutOfBounds {
                field: "forecast days",
                value: self.horizon,
                min: MIN_HORIZON,
                max: MAX_HORIZON,
            });
        }
        self.order.validate()?;
        Ok(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatedForecast {
    pub date: NaiveDate,
    pub step: ForecastStep,
}

#[derive(Debug, Clone)]
pub struct ForecastReport {
    pub series: PriceSeries,
    /// In-sample one-step predictions, second observation through the last.
    pub fitted: Vec<(NaiveDate, f64)>,
    pub forecast: Vec<DatedForecast>,
    pub model: ArimaModel,
    pub confidence: f64,
}

/// The `count` weekdays strictly after `after`. Holidays are not skipped.
pub fn next_business_days(after: NaiveDate, count: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(count);
    let mut day = after;
    while days.len() < count {
        day = match day.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
    }
    days
}

pub struct ForecastService<S: PriceSource> {
    source: S,
    cache: Mutex<PriceCache>,
    confidence: f64,
}

impl<S: PriceSource> ForecastService<S> {
    pub fn new(source: S, cache_ttl: Duration, confidence: f64) -> Self {
        Self {
            source,
            cache: Mutex::new(PriceCache::new(cache_ttl)),
            confidence,
        }
    }

    /// Cached closes for (symbol, period); refetched when missing or stale.
    pub async fn load_series(&self, symbol: &str, period: HistoryPeriod) -> Result<PriceSeries, ForecastError> {
        if let Some(series) = self.cache.lock().await.get(symbol, period, Instant::now()) {
            debug!(symbol, %period, "price cache hit");
            return Ok(series.clone());
        }

        let series = self
            .source
            .fetch_close(symbol, period)
            .await
            .map_err(|source| ForecastError::Fetch {
                symbol: symbol.to_string(),
                source,
            })?;
        if series.is_empty() {
            return Err(ForecastError::NoData {
                symbol: symbol.to_string(),
            });
        }

        info!(symbol, %period, points = series.len(), "fetched daily closes");
        self.cache.lock().await.insert(period, series.clone(), Instant::now());
        Ok(series)
    }

    pub async fn run(&self, request: &ForecastRequest) -> Result<ForecastReport, ForecastError> {
        let symbol = request.validate()?;
        let series = self.load_series(symbol, request.period).await?;

        let closes = series.closes();
        let (order, horizon, confidence) = (request.order, request.horizon, self.confidence);
        // Fitting is CPU-bound; keep it off the async workers.
        let (model, steps) = tokio::task::spawn_blocking(move || -> Result<_, ModelError> {
            let model = ArimaModel::fit(&closes, order)?;
            let steps = model.forecast(horizon, confidence)?;
            Ok((model, steps))
        })
        .await??;

        let fitted = series.points[1..]
            .iter()
            .zip(model.fitted_values())
            .map(|(point, value)| (point.date, value))
            .collect();

        let last_date = series.last_date().ok_or_else(|| ForecastError::NoData {
            symbol: symbol.to_string(),
        })?;
        let forecast = next_business_days(last_date, request.horizon)
            .into_iter()
            .zip(steps)
            .map(|(date, step)| DatedForecast { date, step })
            .collect();

        info!(symbol, order = %request.order, horizon = request.horizon, "forecast generated");
        Ok(ForecastReport {
            series,
            fitted,
            forecast,
            model,
            confidence: self.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_history::PricePoint;
    use anyhow::{Result, anyhow};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Reply {
        Prices,
        Short,
        Empty,
        Fail,
    }

    struct StubSource {
        calls: AtomicUsize,
        reply: Reply,
    }

    impl StubSource {
        fn new(reply: Reply) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply,
            }
        }
    }

    impl PriceSource for StubSource {
        async fn fetch_close(&self, symbol: &str, _period: HistoryPeriod) -> Result<PriceSeries> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let points = match self.reply {
                Reply::Fail => return Err(anyhow!("connection refused")),
                Reply::Empty => Vec::new(),
                Reply::Short => next_business_days(date(2024, 1, 1), 5)
                    .into_iter()
                    .map(|date| PricePoint { date, close: 10.0 })
                    .collect(),
                Reply::Prices => next_business_days(date(2024, 1, 1), 80)
                    .into_iter()
                    .enumerate()
                    .map(|(i, date)| PricePoint {
                        date,
                        close: 100.0 + i as f64 * 0.5 + (i as f64 * 0.7).sin() * 2.0,
                    })
                    .collect(),
            };
            Ok(PriceSeries {
                symbol: symbol.to_string(),
                points,
            })
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn request(symbol: &str) -> ForecastRequest {
        ForecastRequest {
            symbol: symbol.to_string(),
            period: HistoryPeriod::OneYear,
            horizon: 7,
            order: ArimaOrder { p: 2, d: 1, q: 1 },
        }
    }

    fn service(reply: Reply) -> ForecastService<StubSource> {
        ForecastService::new(StubSource::new(reply), Duration::from_secs(300), 0.95)
    }

    #[test]
    fn business_days_skip_weekend_after_friday() {
        let days = next_business_days(date(2024, 6, 7), 7);
        let expected = vec![
            date(2024, 6, 10),
            date(2024, 6, 11),
            date(2024, 6, 12),
            date(2024, 6, 13),
            date(2024, 6, 14),
            date(2024, 6, 17),
            date(2024, 6, 18),
        ];
        assert_eq!(days, expected);
    }

    #[test]
    fn business_days_start_after_a_saturday() {
        assert_eq!(next_business_days(date(2024, 6, 8), 1), vec![date(2024, 6, 10)]);
    }

    #[tokio::test]
    async fn empty_symbol_warns_without_fetching() {
        let service = service(Reply::Prices);

        let err = service.run(&request("   ")).await.unwrap_err();

        assert!(matches!(err, ForecastError::EmptySymbol));
        assert!(err.is_warning());
        assert_eq!(service.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn horizon_outside_bounds_is_rejected() {
        let service = service(Reply::Prices);
        let mut req = request("AAPL");
        req.horizon = 15;

        let err = service.run(&req).await.unwrap_err();

        assert!(matches!(err, ForecastError::OutOfBounds { field: "forecast days", .. }));
        assert_eq!(service.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn report_covers_history_and_horizon() {
        let service = service(Reply::Prices);

        let report = service.run(&request(" AAPL ")).await.unwrap();

        let n = report.series.len();
        assert_eq!(report.series.symbol, "AAPL");
        assert_eq!(report.fitted.len(), n - 1);
        assert_eq!(report.fitted[0].0, report.series.points[1].date);
        assert_eq!(report.fitted[n - 2].0, report.series.last_date().unwrap());

        assert_eq!(report.forecast.len(), 7);
        let expected_dates = next_business_days(report.series.last_date().unwrap(), 7);
        for (forecast, expected) in report.forecast.iter().zip(expected_dates) {
            assert_eq!(forecast.date, expected);
            assert!(forecast.step.lower <= forecast.step.mean);
            assert!(forecast.step.mean <= forecast.step.upper);
        }
    }

    #[tokio::test]
    async fn repeated_render_reuses_cached_series() {
        let service = service(Reply::Prices);

        service.run(&request("AAPL")).await.unwrap();
        service.run(&request("AAPL")).await.unwrap();
        let mut other_period = request("AAPL");
        other_period.period = HistoryPeriod::TwoYears;
        service.run(&other_period).await.unwrap();

        assert_eq!(service.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_payload_is_no_data() {
        let service = service(Reply::Empty);

        let err = service.run(&request("ZZZZ")).await.unwrap_err();

        assert!(matches!(err, ForecastError::NoData { .. }));
        assert!(!err.is_warning());
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_and_not_cached() {
        let service = service(Reply::Fail);

        assert!(matches!(service.run(&request("AAPL")).await, Err(ForecastError::Fetch { .. })));
        assert!(matches!(service.run(&request("AAPL")).await, Err(ForecastError::Fetch { .. })));
        assert_eq!(service.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn too_short_history_is_a_model_error() {
        let service = service(Reply::Short);

        let err = service.run(&request("AAPL")).await.unwrap_err();

        assert!(matches!(err, ForecastError::Model(_)));
    }

    #[tokio::test]
    async fn order_outside_bounds_is_rejected() {
        let service = service(Reply::Prices);
        let mut req = request("AAPL");
        req.order.q = 6;

        assert!(matches!(service.run(&req).await, Err(ForecastError::OutOfBounds { field: "q", .. })));
    }
}
