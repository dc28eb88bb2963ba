use std::sync::Arc;

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use tradestats::{
    chain::RpcBlockchain,
    geo::{GeoResolver, IpCountryTable},
    models::TokenTable,
    Fetcher, LogStorage, RateStorage, Settings, StatStorage, StoreClient, TickerSource,
    TradeEnricher, TradeLogProcessor, UserStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();

    // Load configuration
    let settings =
        Settings::new().context("Failed to load config.yaml. Please ensure it exists and is valid")?;

    let store = Arc::new(
        StoreClient::open(&settings.store.path).context("Failed to open the stat store")?,
    );
    let stats = Arc::new(StatStorage::new(store.clone())?);
    let logs = Arc::new(LogStorage::new(
        store.clone(),
        settings.fetcher.max_range_ns,
    )?);
    let users = Arc::new(UserStorage::new(store.clone())?);
    let rates = Arc::new(RateStorage::new(store));

    let blockchain = Arc::new(
        RpcBlockchain::new(&settings.chain).context("Failed to initialize chain client")?,
    );

    let geo_settings = settings.geo.clone().unwrap_or_default();
    let ip_table = match &geo_settings.ip_ranges_path {
        Some(path) => IpCountryTable::load(path).unwrap_or_else(|e| {
            warn!("ip-to-country table unavailable: {e:#}");
            IpCountryTable::empty()
        }),
        None => IpCountryTable::empty(),
    };
    let geo = Arc::new(GeoResolver::new(geo_settings.broadcast_url.clone(), ip_table)?);

    let tokens = TokenTable::new(settings.tokens.clone());
    let enricher = TradeEnricher::new(tokens.clone(), users.clone());
    let processor = TradeLogProcessor::new(stats, logs.clone(), enricher);

    let fetcher = Arc::new(Fetcher::new(
        logs,
        users,
        rates,
        blockchain,
        geo,
        processor,
        tokens,
        &settings.chain,
    ));

    let cancellation_token = CancellationToken::new();
    let tickers = TickerSource::spawn(&settings.fetcher, &cancellation_token);
    let handles = fetcher.spawn_workers(tickers, &cancellation_token);

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("aggregation workers running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    info!("Finishing all tasks...");
    cancellation_token.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    info!("All workers stopped");
    Ok(())
}
