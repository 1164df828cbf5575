use std::path::PathBuf;
use thiserror::Error;

use crate::arima::ModelError;

/// Failures of one dashboard render cycle.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("Please enter a ticker symbol")]
    EmptySymbol,

    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfBounds {
        field: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },

    #[error("Could not fetch data for {symbol}: {source}")]
    Fetch {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("No price data returned for {symbol}. Check the ticker symbol")]
    NoData { symbol: String },

    #[error("Model fit failed: {0}")]
    Model(#[from] ModelError),

    #[error("Render task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ForecastError {
    /// Input problems are warnings; everything else is an error.
    pub fn is_warning(&self) -> bool {
        matches!(self, ForecastError::EmptySymbol)
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("candle table {0:?} not found, run `backfill` first")]
    TableMissing(PathBuf),

    #[error("malformed kline event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("stream closed by server")]
    Closed,

    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}
