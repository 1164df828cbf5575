//! The persisted candle table: a CSV file rewritten in full after every change.

use crate::candle::CandleRecord;
use crate::storage_utils::AsyncStorageManager;
use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};

pub const DEFAULT_MAX_ROWS: usize = 1000;
pub const HEADER: [&str; 6] = ["time", "open", "high", "low", "close", "volume"];

/// In-memory copy of the table. Rows are unique per `time`, ascending, and never
/// more than `max_rows`.
#[derive(Debug, Clone)]
pub struct CandleTable {
    rows: Vec<CandleRecord>,
    max_rows: usize,
}

impl CandleTable {
    /// Normalises rows read from disk: sorted, one row per timestamp (last one wins).
    pub fn from_records(records: Vec<CandleRecord>, max_rows: usize) -> Self {
        let mut table = Self {
            rows: records,
            max_rows,
        };
        table.normalise();
        table
    }

    /// Appends a closed candle, replacing any row with the same timestamp, then
    /// drops the oldest rows beyond `max_rows`.
    pub fn merge(&mut self, record: CandleRecord) {
        self.rows.push(record);
        self.normalise();
    }

    fn normalise(&mut self) {
        // Stable sort keeps arrival order among equal timestamps.
        self.rows.sort_by_key(|r| r.time);

        let mut unique: Vec<CandleRecord> = Vec::with_capacity(self.rows.len());
        for row in self.rows.drain(..) {
            match unique.last_mut() {
                Some(last) if last.time == row.time => *last = row,
                _ => unique.push(row),
            }
        }

        if unique.len() > self.max_rows {
            let overflow = unique.len() - self.max_rows;
            unique.drain(..overflow);
        }
        self.rows = unique;
    }

    pub fn rows(&self) -> &[CandleRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

pub fn to_csv_bytes(rows: &[CandleRecord]) -> Result<Vec<u8>> {
    // Header is written by hand so an empty table still gets one.
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush csv writer: {}", e))
}

pub fn from_csv_bytes(bytes: &[u8]) -> Result<Vec<CandleRecord>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<CandleRecord>().enumerate() {
        rows.push(result.with_context(|| format!("malformed candle row {}", line + 1))?);
    }
    Ok(rows)
}

pub async fn load_rows(storage: &AsyncStorageManager, file_name: &str) -> Result<Vec<CandleRecord>> {
    let path = storage.path_of(file_name);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;
    from_csv_bytes(&bytes)
}

/// Rewrites the whole file atomically.
pub async fn save_rows(storage: &AsyncStorageManager, file_name: &str, rows: &[CandleRecord]) -> Result<()> {
    let bytes = to_csv_bytes(rows)?;
    storage.write_atomic(file_name, &bytes).await
}
