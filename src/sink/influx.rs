use anyhow::{Context, Result};
use async_trait::async_trait;
use influxdb::{Client, ReadQuery, Timestamp, WriteQuery};
use serde::Deserialize;
use tracing::debug;

use super::TimeSeriesSink;
use crate::data::{Precision, PricePoint};

/// InfluxDB 1.x sink speaking the HTTP API.
pub struct InfluxSink {
    url: String,
    client: Client,
}

impl InfluxSink {
    /// Connects to `host:port` without selecting a database.
    ///
    /// # Arguments
    /// * `host`: Hostname or address; `http://` is assumed unless a scheme is given
    /// * `port`: HTTP API port, usually 8086
    pub fn new(host: &str, port: u16) -> Self {
        let url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host.trim_end_matches('/'), port)
        } else {
            format!("http://{}:{}", host, port)
        };
        let client = Client::new(url.clone(), "");
        Self { url, client }
    }

    /// Database later writes go to; empty until switched.
    pub fn database(&self) -> &str {
        self.client.database_name()
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let body = self
            .client
            .query(ReadQuery::new("SHOW DATABASES"))
            .await
            .with_context(|| format!("Failed to list databases on {}", self.url))?;
        parse_database_names(&body)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.client
            .query(ReadQuery::new(format!("CREATE DATABASE \"{}\"", name)))
            .await
            .with_context(|| format!("Failed to create database {}", name))?;
        Ok(())
    }

    fn switch_database(&mut self, name: &str) {
        self.client = Client::new(self.url.clone(), name);
    }

    async fn write_points(
        &self,
        points: &[PricePoint],
        precision: Precision,
        batch_size: usize,
    ) -> Result<()> {
        for chunk in points.chunks(batch_size.max(1)) {
            let queries = chunk
                .iter()
                .map(|point| to_write_query(point, precision))
                .collect::<Result<Vec<_>>>()?;

            debug!(
                "Writing batch of {} point(s) to {}",
                queries.len(),
                self.database()
            );
            self.client
                .query(queries)
                .await
                .with_context(|| format!("Failed to write to database {}", self.database()))?;
        }
        Ok(())
    }
}

/// Translates a point into a line-protocol write at the given precision.
///
/// # Arguments
/// * `point`: Point to translate
/// * `precision`: Unit of `point.timestamp`
///
/// # Errors
/// Returns an error if the timestamp is negative
pub fn to_write_query(point: &PricePoint, precision: Precision) -> Result<WriteQuery> {
    let time = u128::try_from(point.timestamp)
        .with_context(|| format!("Negative timestamp {} in {}", point.timestamp, point.measurement))?;
    let timestamp = match precision {
        Precision::Seconds => Timestamp::Seconds(time),
        Precision::Milliseconds => Timestamp::Milliseconds(time),
    };

    let mut query = WriteQuery::new(timestamp, point.measurement.as_str());
    for (key, value) in &point.tags {
        query = query.add_tag(key.as_str(), value.as_str());
    }
    for (key, value) in &point.fields {
        query = query.add_field(key.as_str(), *value);
    }
    Ok(query)
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Extracts database names from a `SHOW DATABASES` response body.
///
/// # Errors
/// Returns an error if:
/// - The body is not an InfluxDB query response
/// - A statement result carries an `error`
pub fn parse_database_names(body: &str) -> Result<Vec<String>> {
    let response: QueryResponse =
        serde_json::from_str(body).context("Unexpected SHOW DATABASES response")?;

    let mut names = Vec::new();
    for result in response.results {
        if let Some(error) = result.error {
            anyhow::bail!("InfluxDB error: {}", error);
        }
        for series in result.series {
            names.extend(
                series
                    .values
                    .iter()
                    .filter_map(|row| row.first())
                    .filter_map(|name| name.as_str())
                    .map(str::to_string),
            );
        }
    }
    Ok(names)
}
