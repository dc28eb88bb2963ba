//! Tick channels driving the five workers.
//!
//! Each worker consumes its own channel of wall-clock ticks. Producers are
//! plain intervals; a tick that arrives while the previous run is still in
//! flight is dropped, so runs of one pipeline never overlap.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::FetcherSettings;

pub struct TickerSource {
    pub block_ticker: mpsc::Receiver<DateTime<Utc>>,
    pub log_ticker: mpsc::Receiver<DateTime<Utc>>,
    pub reserve_rates_ticker: mpsc::Receiver<DateTime<Utc>>,
    pub trade_log_ticker: mpsc::Receiver<DateTime<Utc>>,
    pub cat_log_ticker: mpsc::Receiver<DateTime<Utc>>,
}

impl TickerSource {
    /// Spawns one interval producer per worker. Producers exit when the
    /// token is cancelled, which closes the channels and stops the workers
    /// at their next receive.
    pub fn spawn(settings: &FetcherSettings, cancel: &CancellationToken) -> Self {
        Self {
            block_ticker: interval_channel(
                Duration::from_secs(settings.block_interval_secs),
                cancel.clone(),
            ),
            log_ticker: interval_channel(
                Duration::from_secs(settings.log_interval_secs),
                cancel.clone(),
            ),
            reserve_rates_ticker: interval_channel(
                Duration::from_secs(settings.rate_interval_secs),
                cancel.clone(),
            ),
            trade_log_ticker: interval_channel(
                Duration::from_secs(settings.trade_log_interval_secs),
                cancel.clone(),
            ),
            cat_log_ticker: interval_channel(
                Duration::from_secs(settings.cat_log_interval_secs),
                cancel.clone(),
            ),
        }
    }
}

fn interval_channel(
    period: Duration,
    cancel: CancellationToken,
) -> mpsc::Receiver<DateTime<Utc>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // drop the tick if the consumer is still busy
                    let _ = tx.try_send(Utc::now());
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tickers_fire_and_stop_on_cancel() {
        let settings = FetcherSettings {
            block_interval_secs: 1,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let mut tickers = TickerSource::spawn(&settings, &cancel);

        // the first interval tick fires immediately
        let tick = tickers.block_ticker.recv().await;
        assert!(tick.is_some());

        cancel.cancel();
        // channel closes once the producer has observed the cancellation
        loop {
            match tokio::time::timeout(Duration::from_secs(5), tickers.block_ticker.recv()).await
            {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => panic!("ticker channel did not close"),
            }
        }
    }
}
