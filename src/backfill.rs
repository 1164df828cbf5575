//! Seeds the candle table with recent history, once.

use crate::candle_table;
use crate::klines::KlineSource;
use crate::storage_utils::{AsyncStorageManager, MarketConfig};
use anyhow::Result;
use tracing::info;

#[derive(Debug, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// The table already existed; nothing was fetched or written.
    AlreadyPresent,
    Written { rows: usize },
}

pub async fn run<S: KlineSource>(
    storage: &AsyncStorageManager,
    market: &MarketConfig,
    limit: u32,
    source: &S,
) -> Result<BackfillOutcome> {
    let file_name = market.table_file_name();
    let path = storage.path_of(&file_name);

    if path.exists() {
        info!(?path, "candle table already exists, skipping backfill");
        return Ok(BackfillOutcome::AlreadyPresent);
    }

    info!(symbol = %market.symbol, interval = %market.interval, limit, "fetching historical candles");
    let rows = source.fetch_klines(&market.symbol, &market.interval, limit).await?;

    // Rows are kept in the order the exchange returned them.
    candle_table::save_rows(storage, &file_name, &rows).await?;

    info!(?path, rows = rows.len(), "backfill done");
    Ok(BackfillOutcome::Written { rows: rows.len() })
}
