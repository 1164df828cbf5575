mod arima;
mod backfill;
mod candle;
mod candle_table;
mod comfy_table;
mod error;
mod forecast;
mod klines;
mod live_stream;
mod price_history;
mod storage_utils;
mod tui;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::backfill::BackfillOutcome;
use crate::forecast::{ForecastRequest, ForecastService};
use crate::klines::BinanceRestClient;
use crate::price_history::{HistoryPeriod, YahooClient};
use crate::storage_utils::{AppConfig, AsyncStorageManager};

#[derive(Parser)]
#[command(name = "candle-forecast", version, about = "Candle backfill, live append and ARIMA forecasts")]
struct Cli {
    /// Directory holding config.json and candle tables [default: storage/ next to the binary]
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive ARIMA forecast dashboard
    Dashboard,
    /// Seed the candle table with recent candles, unless it already exists
    Backfill,
    /// Append closed candles from the live kline stream to the candle table
    Stream,
    /// Print a single forecast without the dashboard
    Forecast(ForecastArgs),
    /// Print the newest rows of the candle table
    Show {
        #[arg(long, default_value_t = 5)]
        rows: usize,
    },
}

#[derive(Args)]
struct ForecastArgs {
    /// Yahoo Finance ticker, e.g. RELIANCE.NS, ^NSEI, AAPL
    #[arg(long)]
    symbol: Option<String>,
    #[arg(long, value_enum)]
    period: Option<HistoryPeriod>,
    /// Forecast horizon in business days (3-14)
    #[arg(long)]
    days: Option<usize>,
    #[arg(short, long)]
    p: Option<usize>,
    #[arg(short, long)]
    d: Option<usize>,
    #[arg(short, long)]
    q: Option<usize>,
}

fn init_tracing(log_file: Option<std::fs::File>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match log_file {
        // The dashboard owns the terminal, so its logs go to a file.
        Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        None => builder.init(),
    }
}

fn forecast_service(config: &AppConfig) -> Result<ForecastService<YahooClient>> {
    let dashboard = &config.dashboard;
    Ok(ForecastService::new(
        YahooClient::new(&dashboard.chart_url)?,
        Duration::from_secs(dashboard.cache_ttl_secs),
        dashboard.confidence,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let storage = match cli.storage_dir {
        Some(dir) => AsyncStorageManager::new(dir).await?,
        None => AsyncStorageManager::new_relative("storage").await?,
    };

    let log_file = match cli.command {
        Command::Dashboard => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(storage.path_of("dashboard.log"))?,
        ),
        _ => None,
    };
    init_tracing(log_file);

    let config = storage.load_or_init_config().await?;

    match cli.command {
        Command::Dashboard => {
            let service = Arc::new(forecast_service(&config)?);
            tui::run_tui(service, &config.dashboard).await?;
        }
        Command::Backfill => {
            let source = BinanceRestClient::new(&config.backfill.rest_url)?;
            let file_name = config.market.table_file_name();
            match backfill::run(&storage, &config.market, config.backfill.limit, &source).await? {
                BackfillOutcome::AlreadyPresent => {
                    println!("Candle table already exists: {:?}", storage.path_of(&file_name));
                }
                BackfillOutcome::Written { rows } => {
                    println!("Backfill done. Saved {} rows to {:?}", rows, storage.path_of(&file_name));
                    let saved = candle_table::load_rows(&storage, &file_name).await?;
                    println!("{}", comfy_table::candle_tail(&saved, 5));
                }
            }
        }
        Command::Stream => {
            live_stream::run(&storage, &config.market, &config.stream).await?;
        }
        Command::Forecast(args) => {
            let dashboard = &config.dashboard;
            let request = ForecastRequest {
                symbol: args.symbol.unwrap_or_else(|| dashboard.default_symbol.clone()),
                period: args.period.unwrap_or(dashboard.default_period),
                horizon: args.days.unwrap_or(dashboard.forecast_days),
                order: arima::ArimaOrder {
                    p: args.p.unwrap_or(dashboard.order.p),
                    d: args.d.unwrap_or(dashboard.order.d),
                    q: args.q.unwrap_or(dashboard.order.q),
                },
            };
            info!(symbol = %request.symbol.trim(), period = %request.period, "running forecast");

            let report = forecast_service(&config)?.run(&request).await?;
            println!("\n{}", comfy_table::model_summary(&report));
            println!("{}", comfy_table::forecast_table(&report));
        }
        Command::Show { rows } => {
            let file_name = config.market.table_file_name();
            let saved = candle_table::load_rows(&storage, &file_name).await?;
            println!("\n({} rows in {:?})\n{}", saved.len(), storage.path_of(&file_name), comfy_table::candle_tail(&saved, rows));
        }
    }

    Ok(())
}
