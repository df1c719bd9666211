//! # newsbrief — Binary Entrypoint
//! Boots the digest bot: validated config, storage, feed fetcher, market
//! composer, external collaborators, the four-slot scheduler, command
//! intake and the ops HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use newsbrief::api::OpsServer;
use newsbrief::commands::CommandService;
use newsbrief::config::Config;
use newsbrief::digest::Assembler;
use newsbrief::feeds::{Catalogue, FeedFetcher};
use newsbrief::market::commentary::{CommentaryClient, DeepSeekProvider};
use newsbrief::market::provider::CoinGeckoProvider;
use newsbrief::market::MarketComposer;
use newsbrief::sched::Scheduler;
use newsbrief::select::SelectionEngine;
use newsbrief::store::Store;
use newsbrief::transport::TelegramTransport;
use newsbrief::weather::{
    CalendarificProvider, HolidayService, WeatherApiProvider, WeatherService,
};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup failed: {e:#}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(config).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Metrics recorder first so every component's counters register.
    let ops = OpsServer::init()?;

    let store = Arc::new(Store::open(&config.data_dir).context("opening state store")?);

    let catalogue = Catalogue::load_or_builtin(config.feeds_config_path.as_deref())
        .context("loading feed catalogue")?;
    info!(sources = catalogue.len(), "feed catalogue loaded");
    let feeds = Arc::new(FeedFetcher::new(catalogue, config.feed_parallelism)?);

    let market_provider = Arc::new(CoinGeckoProvider::new(
        config.market_index_api_key.clone(),
    )?);
    let commentary = CommentaryClient::new(
        Box::new(DeepSeekProvider::new(config.ai_api_key.clone())?),
        !config.commentary_per_recipient,
    );
    let market = Arc::new(MarketComposer::new(market_provider, commentary));

    let weather = match &config.weather_api_key {
        Some(key) => Some(Arc::new(WeatherService::new(Box::new(
            WeatherApiProvider::new(key.clone())?,
        )))),
        None => {
            warn!("WEATHER_API_KEY not set, weather block disabled");
            None
        }
    };
    let holidays = match &config.holiday_api_key {
        Some(key) => Some(Arc::new(HolidayService::new(Box::new(
            CalendarificProvider::new(key.clone())?,
        )))),
        None => {
            warn!("HOLIDAY_API_KEY not set, holiday line disabled");
            None
        }
    };

    let selection = SelectionEngine::new(feeds.clone(), store.clone());
    let assembler = Arc::new(Assembler::new(
        feeds.clone(),
        selection,
        market.clone(),
        weather.clone(),
        holidays,
    ));

    let transport = Arc::new(TelegramTransport::new(&config.telegram_token)?);

    let scheduler = Scheduler::new(
        store.clone(),
        assembler.clone(),
        transport.clone(),
        config.delivery_parallelism,
        config.tick_interval,
        config.dedup_retention_days,
    );

    let commands = Arc::new(CommandService::new(
        transport,
        store,
        assembler,
        market,
        weather,
    ));

    info!("newsbrief starting");
    tokio::select! {
        _ = scheduler.run() => {},
        _ = commands.run() => {},
        res = ops.serve(config.ops_listen_addr) => {
            res.context("ops surface exited")?;
        },
    }
    Ok(())
}
