use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::arima::ArimaOrder;
use crate::price_history::HistoryPeriod;

// CONFIGURATION STRUCTS
// Every section falls back to its defaults, so a partial config.json is fine.

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MarketConfig {
    pub symbol: String,   // e.g., "BTCUSDT"
    pub interval: String, // e.g., "1m", "15m", "4h"
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
        }
    }
}

impl MarketConfig {
    /// File name of the persisted candle table, e.g. "BTCUSDT_1m.csv".
    pub fn table_file_name(&self) -> String {
        format!("{}_{}.csv", self.symbol.to_uppercase(), self.interval)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackfillConfig {
    pub limit: u32, // e.g., 500 candles
    pub rest_url: String,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            limit: 500,
            rest_url: "https://api.binance.com/api/v3/klines".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub ws_base: String,
    pub max_rows: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_base: "wss://stream.binance.com:9443/ws".to_string(),
            max_rows: crate::candle_table::DEFAULT_MAX_ROWS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub default_symbol: String,
    pub default_period: HistoryPeriod,
    pub forecast_days: usize,
    pub order: ArimaOrder,
    pub cache_ttl_secs: u64,
    pub confidence: f64,
    pub chart_url: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            default_symbol: "RELIANCE.NS".to_string(),
            default_period: HistoryPeriod::OneYear,
            forecast_days: 7,
            order: ArimaOrder::default(),
            cache_ttl_secs: 300,
            confidence: 0.95,
            chart_url: "https://query1.finance.yahoo.com/v8/finance/chart".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    // Nested structs organize the config logically
    pub market: MarketConfig,
    pub backfill: BackfillConfig,
    pub stream: StreamConfig,
    pub dashboard: DashboardConfig,
}

// STORAGE MANAGER

pub struct AsyncStorageManager {
    // Stores the absolute path to the storage directory (e.g., ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// **Constructor: new_relative**
    /// Creates a new manager instance. It calculates the storage path relative
    /// to where the binary executable is running.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;

        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);

        Self::new(base_dir).await
    }

    /// Uses `base_dir` as-is, creating it when missing.
    pub async fn new<P: Into<PathBuf>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();

        // Creating the directory up front means later writes never have to check for it.
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }

        Ok(Self { base_dir })
    }

    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.base_dir.join(file_name)
    }

    /// **Atomic Write**
    /// Writes to a `.tmp` sibling first and renames it over the target, so a crash
    /// mid-write leaves the previous file untouched and valid.
    pub async fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let final_path = self.base_dir.join(file_name);
        let tmp_path = self.base_dir.join(format!("{}.tmp", file_name));

        fs::write(&tmp_path, bytes).await?;
        fs::rename(tmp_path, final_path).await?;

        Ok(())
    }

    /// **Generic Save Function**
    /// Takes any struct that implements `Serialize` and saves it to a pretty JSON file.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let json_bytes = serde_json::to_vec_pretty(data)?;
        self.write_atomic(&format!("{}.json", filename), &json_bytes).await
    }

    /// **Generic Load Function**
    /// Reads `<filename>.json` and deserializes it into `T`.
    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        let path = self.base_dir.join(format!("{}.json", filename));

        // serde_json validates UTF-8 while parsing, so skip `read_to_string`.
        let content = fs::read(path).await?;

        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }

    /// Loads `config.json`, writing the defaults out first if it does not exist yet.
    pub async fn load_or_init_config(&self) -> anyhow::Result<AppConfig> {
        if !self.path_of("config.json").exists() {
            let config = AppConfig::default();
            self.save("config", &config).await?;
            info!(path = ?self.path_of("config.json"), "wrote default config");
            return Ok(config);
        }
        self.load("config").await
    }
}
