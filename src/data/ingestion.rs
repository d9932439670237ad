use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Public CoinGecko REST endpoint.
pub const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

/// A (source asset, destination currency) pair as understood by the provider.
///
/// Both identifiers are opaque provider ids, e.g. `bitcoin` and `usd`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub source: String,
    pub destination: String,
}

impl CurrencyPair {
    /// # Arguments
    /// * `source`: Provider id of the asset being priced (e.g., "bitcoin")
    /// * `destination`: Provider id of the quote currency (e.g., "usd")
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Measurement name written to the time-series database.
    pub fn measurement(&self) -> String {
        format!("{}_to_{}", self.source, self.destination)
    }
}

/// Current price and 24h statistics for one pair.
///
/// Every value is optional: a key the provider omitted or returned as `null`
/// stays `None` instead of turning into zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub price: Option<f64>,
    pub market_cap: Option<f64>,
    pub volume_24h: Option<f64>,
    pub change_24h: Option<f64>,
    pub last_updated_at: Option<i64>,
}

/// One `[timestamp_ms, value]` sample of a historical series.
pub type Sample = (i64, Option<f64>);

/// The three series returned by the market chart endpoint.
///
/// A series the provider left out of the response is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalSeries {
    pub prices: Option<Vec<Sample>>,
    pub market_caps: Option<Vec<Sample>>,
    pub total_volumes: Option<Vec<Sample>>,
}

/// Entry of the provider's coin catalogue.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoinListing {
    pub id: String,
    pub symbol: String,
    pub name: String,
}

/// Source of market data, implemented by [`CoinGeckoClient`].
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Fetches the latest price, market cap, 24h volume and 24h change.
    async fn fetch_current(&self, source: &str, destination: &str) -> Result<PriceObservation>;

    /// Fetches the market chart for the last `days` days. The provider picks
    /// minute resolution up to 1 day, hourly up to 90 days and daily beyond.
    async fn fetch_historical(
        &self,
        source: &str,
        destination: &str,
        days: u32,
    ) -> Result<HistoricalSeries>;

    /// Lists every coin the provider knows about.
    async fn list_coins(&self) -> Result<Vec<CoinListing>>;
}

/// HTTP client for the CoinGecko API.
///
/// No request timeout is configured and failed calls are not retried; the
/// caller decides whether an error ends an iteration or the whole run.
pub struct CoinGeckoClient {
    base_url: String,
    client: reqwest::Client,
}

impl CoinGeckoClient {
    /// Creates a client for the public CoinGecko endpoint.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built
    pub fn new() -> Result<Self> {
        Self::with_base_url(COINGECKO_API_URL)
    }

    /// Creates a client that talks to a CoinGecko-compatible API at `base_url`.
    ///
    /// # Arguments
    /// * `base_url`: API root without a trailing path, e.g. `https://api.coingecko.com/api/v3`.
    ///   A trailing slash is stripped.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("crypto_to_influxdb/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "CoinGecko API returned error status: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }

        response
            .json::<Value>()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}

#[async_trait]
impl MarketDataProvider for CoinGeckoClient {
    async fn fetch_current(&self, source: &str, destination: &str) -> Result<PriceObservation> {
        let response = self
            .get_json(
                "/simple/price",
                &[
                    ("ids", source),
                    ("vs_currencies", destination),
                    ("include_market_cap", "true"),
                    ("include_24hr_vol", "true"),
                    ("include_24hr_change", "true"),
                    ("include_last_updated_at", "true"),
                ],
            )
            .await?;

        Ok(parse_current(&response, source, destination))
    }

    async fn fetch_historical(
        &self,
        source: &str,
        destination: &str,
        days: u32,
    ) -> Result<HistoricalSeries> {
        let days = days.to_string();
        let response = self
            .get_json(
                &format!("/coins/{}/market_chart", source),
                &[("vs_currency", destination), ("days", days.as_str())],
            )
            .await?;

        parse_historical(&response)
    }

    async fn list_coins(&self) -> Result<Vec<CoinListing>> {
        let response = self.get_json("/coins/list", &[]).await?;
        serde_json::from_value(response).context("Unexpected coin list format")
    }
}

/// Reads a `/simple/price` response by nested lookup under `source`.
///
/// # Arguments
/// * `response`: Decoded JSON body
/// * `source`: Provider id of the asset, the top-level key of the body
/// * `destination`: Quote currency; prefixes the statistic keys (`usd_market_cap`, ...)
///
/// # Returns
/// The observation, with `None` for every key that is missing or `null`
pub fn parse_current(response: &Value, source: &str, destination: &str) -> PriceObservation {
    let entry = response.get(source);
    let number = |key: &str| entry.and_then(|e| e.get(key)).and_then(Value::as_f64);

    PriceObservation {
        price: number(destination),
        market_cap: number(&format!("{}_market_cap", destination)),
        volume_24h: number(&format!("{}_24h_vol", destination)),
        change_24h: number(&format!("{}_24h_change", destination)),
        last_updated_at: entry
            .and_then(|e| e.get("last_updated_at"))
            .and_then(as_timestamp),
    }
}

/// Reads a `/coins/{id}/market_chart` response.
///
/// # Errors
/// Returns an error if:
/// - The body carries an `error` key
/// - A series is not an array of `[timestamp, value]` pairs
///
/// # Returns
/// The three series; a series missing from the body is `None`
pub fn parse_historical(response: &Value) -> Result<HistoricalSeries> {
    if let Some(error) = response.get("error") {
        anyhow::bail!("CoinGecko API error: {}", error);
    }

    Ok(HistoricalSeries {
        prices: parse_series(response, "prices")?,
        market_caps: parse_series(response, "market_caps")?,
        total_volumes: parse_series(response, "total_volumes")?,
    })
}

fn parse_series(response: &Value, key: &str) -> Result<Option<Vec<Sample>>> {
    let raw = match response.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(raw) => raw
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Series {} is not an array", key))?,
    };

    let mut samples = Vec::with_capacity(raw.len());
    for entry in raw {
        let pair = entry
            .as_array()
            .filter(|pair| pair.len() == 2)
            .ok_or_else(|| anyhow::anyhow!("Invalid sample in {}: {}", key, entry))?;
        let timestamp = as_timestamp(&pair[0])
            .ok_or_else(|| anyhow::anyhow!("Invalid timestamp in {}: {}", key, pair[0]))?;
        samples.push((timestamp, pair[1].as_f64()));
    }

    Ok(Some(samples))
}

fn as_timestamp(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        pub Provider {}

        #[async_trait]
        impl MarketDataProvider for Provider {
            async fn fetch_current(&self, source: &str, destination: &str) -> Result<PriceObservation>;
            async fn fetch_historical(
                &self,
                source: &str,
                destination: &str,
                days: u32,
            ) -> Result<HistoricalSeries>;
            async fn list_coins(&self) -> Result<Vec<CoinListing>>;
        }
    }
}
