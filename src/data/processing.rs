use super::ingestion::{CurrencyPair, HistoricalSeries, PriceObservation, Sample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag value identifying where every point came from.
pub const SOURCE_TAG: &str = "coingecko";

/// Day windows requested during backfill. Each one gets a different
/// resolution from the provider: daily, hourly and minutely.
pub const BACKFILL_WINDOWS: [u32; 3] = [365 * 10, 90, 1];

/// Unit of [`PricePoint::timestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Seconds,
    Milliseconds,
}

/// One record handed to the time-series sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub timestamp: i64,
    pub fields: BTreeMap<String, f64>,
}

impl PricePoint {
    fn new(pair: &CurrencyPair, timestamp: i64, fields: BTreeMap<String, f64>) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("source".to_string(), SOURCE_TAG.to_string());

        Self {
            measurement: pair.measurement(),
            tags,
            timestamp,
            fields,
        }
    }

    /// Builds a live point (timestamp in seconds) from a current observation.
    ///
    /// # Arguments
    /// * `pair`: Pair the observation belongs to
    /// * `observation`: Values from the provider; absent ones are left out of the field set
    /// * `fallback_time`: Timestamp used when the provider gave no update time
    ///
    /// # Returns
    /// `None` when there is nothing to write at all
    pub fn from_observation(
        pair: &CurrencyPair,
        observation: &PriceObservation,
        fallback_time: i64,
    ) -> Option<Self> {
        let mut fields = BTreeMap::new();
        let candidates = [
            ("price", observation.price),
            ("market_cap", observation.market_cap),
            ("24h_vol", observation.volume_24h),
            ("24h_change", observation.change_24h),
        ];
        for (name, value) in candidates {
            if let Some(value) = value {
                fields.insert(name.to_string(), value);
            }
        }

        if fields.is_empty() {
            return None;
        }

        let timestamp = observation.last_updated_at.unwrap_or(fallback_time);
        Some(Self::new(pair, timestamp, fields))
    }
}

/// Series carried by the market chart endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Price,
    MarketCap,
    TotalVolume,
}

impl Metric {
    /// Field name used on the emitted point.
    pub fn field_name(self) -> &'static str {
        match self {
            Metric::Price => "price",
            Metric::MarketCap => "market_cap",
            Metric::TotalVolume => "24h_vol",
        }
    }
}

/// Per-timestamp accumulator used while merging backfill windows.
///
/// Keys are provider timestamps in milliseconds.
#[derive(Debug, Default)]
pub struct SeriesMap {
    entries: BTreeMap<i64, BTreeMap<Metric, Option<f64>>>,
}

impl SeriesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges one fetched window.
    ///
    /// Every sample, `null` included, overwrites whatever an earlier window
    /// stored for the same timestamp and metric.
    ///
    /// # Arguments
    /// * `series`: One window as returned by the provider
    pub fn merge(&mut self, series: &HistoricalSeries) {
        let named: [(Metric, &Option<Vec<Sample>>); 3] = [
            (Metric::Price, &series.prices),
            (Metric::MarketCap, &series.market_caps),
            (Metric::TotalVolume, &series.total_volumes),
        ];

        for (metric, samples) in named {
            let Some(samples) = samples else {
                continue;
            };
            for &(timestamp, value) in samples {
                self.entries
                    .entry(timestamp)
                    .or_default()
                    .insert(metric, value);
            }
        }
    }

    /// Converts the merged samples into points.
    ///
    /// # Arguments
    /// * `pair`: Pair the samples belong to; names the measurement
    ///
    /// # Returns
    /// One point per timestamp, oldest first. Metrics whose last merged sample
    /// was `null` are left out, and timestamps with no value left are dropped.
    pub fn into_points(self, pair: &CurrencyPair) -> Vec<PricePoint> {
        self.entries
            .into_iter()
            .filter_map(|(timestamp, metrics)| {
                let fields: BTreeMap<String, f64> = metrics
                    .into_iter()
                    .filter_map(|(metric, value)| {
                        value.map(|value| (metric.field_name().to_string(), value))
                    })
                    .collect();
                if fields.is_empty() {
                    None
                } else {
                    Some(PricePoint::new(pair, timestamp, fields))
                }
            })
            .collect()
    }
}

/// Merges fetched windows so that finer resolution wins on overlap.
///
/// Windows are applied from the widest day span to the narrowest, whatever
/// order they are passed in, so the most granular sample for a timestamp is
/// the one that survives.
///
/// # Arguments
/// * `windows`: `(days, series)` pairs as fetched
pub fn merge_windows(mut windows: Vec<(u32, HistoricalSeries)>) -> SeriesMap {
    windows.sort_by(|a, b| b.0.cmp(&a.0));

    let mut merged = SeriesMap::new();
    for (_, series) in &windows {
        merged.merge(series);
    }
    merged
}
