use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::config::WRITE_BATCH_SIZE;
use crate::data::{merge_windows, CurrencyPair, MarketDataProvider, Precision, PricePoint};
use crate::sink::TimeSeriesSink;

/// Totals reported at the end of a backfill run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub pairs: usize,
    pub written: usize,
    pub failed: usize,
}

/// One-shot historical import over several resolution windows.
pub struct Backfill<'a> {
    provider: &'a dyn MarketDataProvider,
    sink: &'a dyn TimeSeriesSink,
    windows: Vec<u32>,
}

impl<'a> Backfill<'a> {
    pub fn new(
        provider: &'a dyn MarketDataProvider,
        sink: &'a dyn TimeSeriesSink,
        windows: &[u32],
    ) -> Self {
        Self {
            provider,
            sink,
            windows: windows.to_vec(),
        }
    }

    /// Fetches every window for `pair` and merges them into one point per
    /// timestamp, finer windows winning on overlap.
    pub async fn points_for(&self, pair: &CurrencyPair) -> Result<Vec<PricePoint>> {
        let mut fetched = Vec::with_capacity(self.windows.len());
        for &days in &self.windows {
            info!(
                "Fetching {} to {} exchange rate for {} days...",
                pair.source, pair.destination, days
            );
            let series = self
                .provider
                .fetch_historical(&pair.source, &pair.destination, days)
                .await
                .with_context(|| format!("Failed to fetch {} days of {}", days, pair.measurement()))?;
            fetched.push((days, series));
        }

        let merged = merge_windows(fetched);
        if merged.is_empty() {
            info!("No history returned for {}", pair.measurement());
        } else {
            debug!(
                "Merged {} distinct timestamp(s) for {}",
                merged.len(),
                pair.measurement()
            );
        }
        Ok(merged.into_points(pair))
    }

    /// Backfills each pair in turn. A fetch error aborts the run; a write
    /// error is logged and counted.
    pub async fn run(&self, pairs: &[CurrencyPair]) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();

        for pair in pairs {
            let points = self.points_for(pair).await?;
            report.pairs += 1;
            debug!("Data: {:#?}", points);

            info!(
                "Writing {} data points for {}...",
                points.len(),
                pair.measurement()
            );
            match self
                .sink
                .write_points(&points, Precision::Milliseconds, WRITE_BATCH_SIZE)
                .await
            {
                Ok(()) => {
                    info!("Success writing {} data points!", points.len());
                    report.written += points.len();
                }
                Err(e) => {
                    error!("FAILED writing {} data points! {:#}", points.len(), e);
                    report.failed += points.len();
                }
            }
        }

        Ok(report)
    }
}
