//! Appends closed candles from the Binance kline stream to the candle table.

use crate::candle::{CandleRecord, deserialize_f64_lenient};
use crate::candle_table::{self, CandleTable};
use crate::error::StreamError;
use crate::storage_utils::{AsyncStorageManager, MarketConfig, StreamConfig};
use anyhow::Result;
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

/// Kline stream payload; only the nested candle is used.
#[derive(Deserialize, Debug)]
pub struct KlineEvent {
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Deserialize, Debug)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "o", deserialize_with = "deserialize_f64_lenient")]
    pub open: f64,
    #[serde(rename = "h", deserialize_with = "deserialize_f64_lenient")]
    pub high: f64,
    #[serde(rename = "l", deserialize_with = "deserialize_f64_lenient")]
    pub low: f64,
    #[serde(rename = "c", deserialize_with = "deserialize_f64_lenient")]
    pub close: f64,
    #[serde(rename = "v", deserialize_with = "deserialize_f64_lenient")]
    pub volume: f64,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl KlinePayload {
    fn to_record(&self) -> Option<CandleRecord> {
        CandleRecord::from_open_time_ms(self.open_time, self.open, self.high, self.low, self.close, self.volume)
    }
}

pub fn stream_url(ws_base: &str, market: &MarketConfig) -> String {
    format!(
        "{}/{}@kline_{}",
        ws_base.trim_end_matches('/'),
        market.symbol.to_lowercase(),
        market.interval
    )
}

/// Owns the in-memory table between messages. Built only once the table file
/// has been loaded, so holding one means the appender is listening.
pub struct StreamAppender<'a> {
    storage: &'a AsyncStorageManager,
    file_name: String,
    table: CandleTable,
}

impl<'a> StreamAppender<'a> {
    /// Loading state: the table written by `backfill` must already exist.
    pub async fn load(
        storage: &'a AsyncStorageManager,
        market: &MarketConfig,
        max_rows: usize,
    ) -> Result<Self> {
        let file_name = market.table_file_name();
        let path = storage.path_of(&file_name);
        if !path.exists() {
            return Err(StreamError::TableMissing(path).into());
        }

        let rows = candle_table::load_rows(storage, &file_name).await?;
        let table = CandleTable::from_records(rows, max_rows);
        info!(rows = table.len(), ?path, "loaded existing candle table");

        Ok(Self {
            storage,
            file_name,
            table,
        })
    }

    pub fn table(&self) -> &CandleTable {
        &self.table
    }

    /// Handles one text frame. Returns the saved record when the candle was closed.
    pub async fn handle_text(&mut self, text: &str) -> Result<Option<CandleRecord>> {
        let event: KlineEvent = serde_json::from_str(text).map_err(StreamError::from)?;

        // Intra-interval updates are not final yet.
        if !event.kline.is_closed {
            return Ok(None);
        }

        let record = event
            .kline
            .to_record()
            .ok_or_else(|| anyhow::anyhow!("kline open time out of range: {}", event.kline.open_time))?;

        self.table.merge(record.clone());
        candle_table::save_rows(self.storage, &self.file_name, self.table.rows()).await?;

        Ok(Some(record))
    }

    /// Listening state: runs until the connection ends or something fails.
    pub async fn listen(&mut self, url: &str) -> Result<()> {
        info!(url, "connecting to kline stream");
        let (mut ws, _) = connect_async(url).await.map_err(StreamError::from)?;

        while let Some(message) = ws.next().await {
            match message.map_err(StreamError::from)? {
                Message::Text(text) => {
                    if let Some(record) = self.handle_text(&text).await? {
                        info!(
                            time = %record.time,
                            close = %format!("{:.2}", record.close),
                            rows = self.table().len(),
                            "saved closed candle"
                        );
                    }
                }
                Message::Close(frame) => {
                    debug!(?frame, "server sent close frame");
                    break;
                }
                // Pings are answered by tungstenite itself.
                _ => {}
            }
        }

        Err(StreamError::Closed.into())
    }
}

pub async fn run(storage: &AsyncStorageManager, market: &MarketConfig, stream: &StreamConfig) -> Result<()> {
    let mut appender = StreamAppender::load(storage, market, stream.max_rows).await?;
    appender.listen(&stream_url(&stream.ws_base, market)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_table::DEFAULT_MAX_ROWS;
    use futures::SinkExt;
    use tokio::net::TcpListener;

    const OPEN_TIME: i64 = 1_700_000_040_000;

    fn event(open_time: i64, close: &str, closed: bool) -> String {
        format!(
            r#"{{"e":"kline","E":{e},"s":"BTCUSDT","k":{{"t":{t},"T":{end},"s":"BTCUSDT","i":"1m","o":"100.0","c":"{close}","h":"102.0","l":"99.0","v":"7.5","n":42,"x":{closed},"q":"750.0"}}}}"#,
            e = open_time + 59_000,
            t = open_time,
            end = open_time + 59_999,
        )
    }

    async fn seeded_storage(dir: &std::path::Path) -> (AsyncStorageManager, MarketConfig) {
        let storage = AsyncStorageManager::new(dir).await.unwrap();
        let market = MarketConfig::default();
        let seed = CandleRecord::from_open_time_ms(OPEN_TIME - 60_000, 1.0, 1.0, 1.0, 1.0, 1.0).unwrap();
        candle_table::save_rows(&storage, &market.table_file_name(), &[seed]).await.unwrap();
        (storage, market)
    }

    /// Local websocket server that sends `frames` to the first client, then
    /// either waits for the close handshake or drops the socket.
    async fn kline_server(frames: Vec<Message>, drop_abruptly: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in frames {
                if ws.send(frame).await.is_err() {
                    return;
                }
            }
            if drop_abruptly {
                return;
            }
            while let Some(Ok(_)) = ws.next().await {}
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn listen_saves_closed_candles_until_close_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, market) = seeded_storage(dir.path()).await;
        let mut appender = StreamAppender::load(&storage, &market, DEFAULT_MAX_ROWS).await.unwrap();
        let url = kline_server(
            vec![
                Message::Binary(vec![1, 2, 3]),
                Message::Ping(vec![9]),
                Message::Text(event(OPEN_TIME, "100.5", false)),
                Message::Text(event(OPEN_TIME, "101.0", true)),
                Message::Close(None),
            ],
            false,
        )
        .await;

        let err = appender.listen(&url).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::Closed)));
        let saved = candle_table::load_rows(&storage, &market.table_file_name()).await.unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].close, 101.0);
    }

    #[tokio::test]
    async fn dropped_connection_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, market) = seeded_storage(dir.path()).await;
        let mut appender = StreamAppender::load(&storage, &market, DEFAULT_MAX_ROWS).await.unwrap();
        let url = kline_server(vec![Message::Text(event(OPEN_TIME, "101.0", true))], true).await;

        let err = appender.listen(&url).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::Transport(_))));
        assert_eq!(appender.table().len(), 2);
    }

    #[test]
    fn builds_lowercase_stream_url() {
        let url = stream_url("wss://stream.binance.com:9443/ws/", &MarketConfig::default());
        assert_eq!(url, "wss://stream.binance.com:9443/ws/btcusdt@kline_1m");
    }

    #[tokio::test]
    async fn missing_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();

        let err = StreamAppender::load(&storage, &MarketConfig::default(), DEFAULT_MAX_ROWS)
            .await
            .err()
            .unwrap();

        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::TableMissing(_))));
    }

    #[tokio::test]
    async fn open_candle_updates_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, market) = seeded_storage(dir.path()).await;
        let path = storage.path_of(&market.table_file_name());
        let before = std::fs::read(&path).unwrap();
        let mut appender = StreamAppender::load(&storage, &market, DEFAULT_MAX_ROWS).await.unwrap();

        let saved = appender.handle_text(&event(OPEN_TIME, "100.5", false)).await.unwrap();

        assert!(saved.is_none());
        assert_eq!(appender.table().len(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn repeated_closed_candle_keeps_last_close() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, market) = seeded_storage(dir.path()).await;
        let mut appender = StreamAppender::load(&storage, &market, DEFAULT_MAX_ROWS).await.unwrap();

        appender.handle_text(&event(OPEN_TIME, "100.5", true)).await.unwrap();
        appender.handle_text(&event(OPEN_TIME, "101.0", true)).await.unwrap();

        let rows = candle_table::load_rows(&storage, &market.table_file_name()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].close, 101.0);
        assert_eq!(rows[1].high, 102.0);
        assert_eq!(rows[1].volume, 7.5);
    }

    #[tokio::test]
    async fn file_never_exceeds_row_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, market) = seeded_storage(dir.path()).await;
        let mut appender = StreamAppender::load(&storage, &market, 3).await.unwrap();

        for i in 0..5 {
            appender
                .handle_text(&event(OPEN_TIME + i * 60_000, "100.0", true))
                .await
                .unwrap();
        }

        let rows = candle_table::load_rows(&storage, &market.table_file_name()).await.unwrap();
        assert_eq!(rows.len(), 3);
        let newest = CandleRecord::from_open_time_ms(OPEN_TIME + 4 * 60_000, 0.0, 0.0, 0.0, 0.0, 0.0).unwrap();
        assert_eq!(rows[2].time, newest.time);
    }

    #[tokio::test]
    async fn malformed_message_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, market) = seeded_storage(dir.path()).await;
        let mut appender = StreamAppender::load(&storage, &market, DEFAULT_MAX_ROWS).await.unwrap();

        let err = appender.handle_text(r#"{"result":null,"id":1}"#).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::Malformed(_))));
    }
}
