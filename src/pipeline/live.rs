use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::WRITE_BATCH_SIZE;
use crate::data::{CurrencyPair, MarketDataProvider, Precision, PricePoint};
use crate::scheduler::Job;
use crate::sink::TimeSeriesSink;

/// Polls the current price of every configured pair and writes one batch.
pub struct LiveJob {
    provider: Box<dyn MarketDataProvider>,
    sink: Box<dyn TimeSeriesSink>,
    pairs: Vec<CurrencyPair>,
    database: String,
}

impl LiveJob {
    pub fn new(
        provider: Box<dyn MarketDataProvider>,
        sink: Box<dyn TimeSeriesSink>,
        pairs: Vec<CurrencyPair>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            sink,
            pairs,
            database: database.into(),
        }
    }

    /// Fetches every pair. The first failed fetch aborts the cycle.
    pub async fn collect_points(&self) -> Result<Vec<PricePoint>> {
        let mut points = Vec::with_capacity(self.pairs.len());

        for pair in &self.pairs {
            debug!(
                "Fetching {} to {} exchange rate...",
                pair.source, pair.destination
            );
            let observation = self
                .provider
                .fetch_current(&pair.source, &pair.destination)
                .await
                .with_context(|| format!("Failed to fetch {}", pair.measurement()))?;

            info!(
                "RECEIVED: {} in {} is {:?} - at {:?}",
                pair.source, pair.destination, observation.price, observation.last_updated_at
            );

            match PricePoint::from_observation(pair, &observation, Utc::now().timestamp()) {
                Some(point) => points.push(point),
                None => warn!("No values received for {}, skipping", pair.measurement()),
            }
        }

        Ok(points)
    }
}

#[async_trait]
impl Job for LiveJob {
    fn name(&self) -> &str {
        "live-prices"
    }

    async fn run(&mut self) -> Result<()> {
        info!("==========================================");
        info!(
            "{} - Starting next run...",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );

        let points = self.collect_points().await?;
        debug!("Data: {:#?}", points);

        info!("Writing to {} database...", self.database);
        match self
            .sink
            .write_points(&points, Precision::Seconds, WRITE_BATCH_SIZE)
            .await
        {
            Ok(()) => info!("Success writing {} data point(s)!", points.len()),
            Err(e) => error!("FAILED writing {} data point(s)! {:#}", points.len(), e),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ingestion::mock::MockProvider;
    use crate::data::ingestion::PriceObservation;
    use crate::sink::mock::MockSink;
    use std::sync::{Arc, Mutex};

    fn bitcoin_usd() -> PriceObservation {
        PriceObservation {
            price: Some(50000.12),
            market_cap: Some(9.8e11),
            volume_24h: Some(3.2e10),
            change_24h: Some(1.5),
            last_updated_at: Some(1700000000),
        }
    }

    fn capturing_sink(written: Arc<Mutex<Vec<PricePoint>>>) -> MockSink {
        let mut sink = MockSink::new();
        sink.expect_write_points()
            .withf(|_, precision, batch_size| {
                *precision == Precision::Seconds && *batch_size == WRITE_BATCH_SIZE
            })
            .times(1)
            .returning(move |points, _, _| {
                written.lock().unwrap().extend_from_slice(points);
                Ok(())
            });
        sink
    }

    #[tokio::test]
    async fn test_cycle_writes_one_point_per_pair() {
        let mut provider = MockProvider::new();
        provider
            .expect_fetch_current()
            .withf(|src, dst| src == "bitcoin" && dst == "usd")
            .times(1)
            .returning(|_, _| Ok(bitcoin_usd()));
        provider
            .expect_fetch_current()
            .withf(|src, dst| src == "ethereum" && dst == "usd")
            .times(1)
            .returning(|_, _| {
                Ok(PriceObservation {
                    price: Some(3000.0),
                    market_cap: None,
                    last_updated_at: Some(1700000005),
                    ..Default::default()
                })
            });

        let written = Arc::new(Mutex::new(Vec::new()));
        let mut job = LiveJob::new(
            Box::new(provider),
            Box::new(capturing_sink(Arc::clone(&written))),
            vec![
                CurrencyPair::new("bitcoin", "usd"),
                CurrencyPair::new("ethereum", "usd"),
            ],
            "crypto",
        );

        job.run().await.unwrap();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 2);

        let btc = &written[0];
        assert_eq!(btc.measurement, "bitcoin_to_usd");
        assert_eq!(btc.tags["source"], "coingecko");
        assert_eq!(btc.timestamp, 1700000000);
        assert_eq!(btc.fields["price"], 50000.12);
        assert_eq!(btc.fields["market_cap"], 9.8e11);
        assert_eq!(btc.fields["24h_vol"], 3.2e10);
        assert_eq!(btc.fields["24h_change"], 1.5);

        let eth = &written[1];
        assert_eq!(eth.measurement, "ethereum_to_usd");
        assert_eq!(eth.fields.len(), 1);
        assert!(!eth.fields.contains_key("market_cap"));
    }

    #[tokio::test]
    async fn test_fetch_failure_ends_iteration_without_write() {
        let mut provider = MockProvider::new();
        provider
            .expect_fetch_current()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("HTTP 503")));

        let mut sink = MockSink::new();
        sink.expect_write_points().never();

        let mut job = LiveJob::new(
            Box::new(provider),
            Box::new(sink),
            vec![
                CurrencyPair::new("bitcoin", "usd"),
                CurrencyPair::new("ethereum", "usd"),
            ],
            "crypto",
        );

        let err = job.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("bitcoin_to_usd"));
    }

    #[tokio::test]
    async fn test_write_failure_is_not_an_iteration_error() {
        let mut provider = MockProvider::new();
        provider
            .expect_fetch_current()
            .returning(|_, _| Ok(bitcoin_usd()));

        let mut sink = MockSink::new();
        sink.expect_write_points()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("database unavailable")));

        let mut job = LiveJob::new(
            Box::new(provider),
            Box::new(sink),
            vec![CurrencyPair::new("bitcoin", "usd")],
            "crypto",
        );

        assert!(job.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_pair_without_values_is_skipped() {
        let mut provider = MockProvider::new();
        provider
            .expect_fetch_current()
            .returning(|_, _| Ok(PriceObservation::default()));

        let written = Arc::new(Mutex::new(Vec::new()));
        let mut job = LiveJob::new(
            Box::new(provider),
            Box::new(capturing_sink(Arc::clone(&written))),
            vec![CurrencyPair::new("not-a-coin", "usd")],
            "crypto",
        );

        job.run().await.unwrap();
        assert!(written.lock().unwrap().is_empty());
    }
}
