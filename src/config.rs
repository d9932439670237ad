use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

use crate::data::CurrencyPair;

/// Seconds between two live polling iterations.
pub const INTERVAL_TIME_SEC: u64 = 60;

/// Upper bound on points per write request to the time-series database.
pub const WRITE_BATCH_SIZE: usize = 5000;

/// Raised when the resolved settings cannot be used to start the service.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "invalid settings: INFLUXDB_HOST={host:?}, INFLUXDB_PORT={port}, INFLUXDB_DB_NAME={db_name:?}"
    )]
    Invalid {
        host: String,
        port: u16,
        db_name: String,
    },
    #[error("setting {key} has unusable value {value:?}")]
    Malformed { key: &'static str, value: String },
}

impl ConfigError {
    /// Logs the offending values at `ERROR`, ahead of a status 1 exit.
    pub fn log(&self) {
        error!("One of the input environment variables is not set correctly.");
        match self {
            ConfigError::Invalid {
                host,
                port,
                db_name,
            } => {
                error!("    INFLUXDB_HOST:      {}", host);
                error!("    INFLUXDB_PORT:      {}", port);
                error!("    INFLUXDB_DB_NAME:   {}", db_name);
            }
            ConfigError::Malformed { key, value } => {
                error!("    {:<20}{:?}", format!("{}:", key), value);
            }
        }
        error!("Please check the environment variables and start again. Exiting.");
    }
}

/// One `[[currencies]]` entry. Every source is paired with every destination.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CurrencyGroup {
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub destination: Vec<String>,
}

impl CurrencyGroup {
    /// # Returns
    /// Every source paired with every destination, sources outer and
    /// destinations inner
    pub fn pairs(&self) -> impl Iterator<Item = CurrencyPair> + '_ {
        self.source.iter().flat_map(move |src| {
            self.destination
                .iter()
                .map(move |dst| CurrencyPair::new(src.clone(), dst.clone()))
        })
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub debug: bool,
    pub influxdb_host: String,
    pub influxdb_port: u16,
    pub influxdb_db_name: String,
    pub currencies: Vec<CurrencyGroup>,
}

/// Looks `key` up in the file table, then in the environment, then falls back
/// to `default`. File values that are not strings are rendered through TOML.
///
/// # Arguments
/// * `file`: Parsed configuration file
/// * `env`: Environment lookup, `std::env::var` in production
/// * `key`: Setting name, identical in the file and the environment
/// * `default`: Value used when neither source has the key
pub fn resolve_setting<F>(file: &toml::Table, env: F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match file.get(key) {
        Some(toml::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => env(key).unwrap_or_else(|| default.to_string()),
    }
}

impl Settings {
    /// Reads the TOML file at `path` and resolves it against the process
    /// environment.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - Any error listed on [`Settings::from_toml_str`]
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&raw, |key| std::env::var(key).ok())
    }

    /// Resolves settings from TOML text, consulting `env` for keys the text
    /// does not set.
    ///
    /// # Arguments
    /// * `raw`: TOML document
    /// * `env`: Environment lookup
    ///
    /// # Errors
    /// Returns an error if:
    /// - `raw` is not valid TOML
    /// - `INFLUXDB_PORT` is not a port number ([`ConfigError::Malformed`])
    /// - The `[[currencies]]` section has the wrong shape
    pub fn from_toml_str<F>(raw: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: toml::Table = raw.parse().context("Failed to parse configuration file")?;

        let debug = resolve_setting(&file, &env, "DEBUG_FLAG", "false").to_lowercase() == "true";
        let influxdb_host = resolve_setting(&file, &env, "INFLUXDB_HOST", "");
        let port_raw = resolve_setting(&file, &env, "INFLUXDB_PORT", "0");
        let influxdb_port = port_raw.trim().parse::<u16>().map_err(|_| ConfigError::Malformed {
            key: "INFLUXDB_PORT",
            value: port_raw.clone(),
        })?;
        let influxdb_db_name = resolve_setting(&file, &env, "INFLUXDB_DB_NAME", "");

        let currencies = match file.get("currencies") {
            Some(value) => value
                .clone()
                .try_into::<Vec<CurrencyGroup>>()
                .context("Invalid [[currencies]] section")?,
            None => Vec::new(),
        };

        Ok(Self {
            debug,
            influxdb_host,
            influxdb_port,
            influxdb_db_name,
            currencies,
        })
    }

    /// Rejects settings that would leave the service without a database.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] when the host or database name is empty or
    /// the port is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.influxdb_host.is_empty() || self.influxdb_port == 0 || self.influxdb_db_name.is_empty()
        {
            return Err(ConfigError::Invalid {
                host: self.influxdb_host.clone(),
                port: self.influxdb_port,
                db_name: self.influxdb_db_name.clone(),
            });
        }
        Ok(())
    }

    /// All configured pairs, entry by entry, sources outer and destinations inner.
    pub fn pairs(&self) -> Vec<CurrencyPair> {
        self.currencies.iter().flat_map(CurrencyGroup::pairs).collect()
    }

    /// Logs the values that made [`Settings::validate`] fail, at `ERROR`.
    pub fn log_invalid(&self) {
        error!("One of the input environment variables is not set correctly.");
        error!("    DEBUG_FLAG:         {}", self.debug);
        error!("    INFLUXDB_HOST:      {}", self.influxdb_host);
        error!("    INFLUXDB_PORT:      {}", self.influxdb_port);
        error!("    INFLUXDB_DB_NAME:   {}", self.influxdb_db_name);
        error!("Please check the environment variables and start again. Exiting.");
    }

    /// Logs the effective settings and constants at `DEBUG`.
    pub fn log_summary(&self) {
        debug!("Running with the below variables:");
        debug!("  Environment Variables");
        debug!("    DEBUG_FLAG:               {}", self.debug);
        debug!("    INFLUXDB_HOST:            {}", self.influxdb_host);
        debug!("    INFLUXDB_PORT:            {}", self.influxdb_port);
        debug!("    INFLUXDB_DB_NAME:         {}", self.influxdb_db_name);
        debug!("  Constants");
        debug!("    interval_time_sec:        {}", INTERVAL_TIME_SEC);
        for group in &self.currencies {
            debug!("    currencies[sources]:      {}", dedup_join(&group.source));
            debug!("    currencies[destinations]: {}", dedup_join(&group.destination));
            debug!("{}", "=".repeat(40));
        }
    }
}

fn dedup_join(values: &[String]) -> String {
    let mut seen: Vec<&str> = Vec::with_capacity(values.len());
    for v in values {
        if !seen.contains(&v.as_str()) {
            seen.push(v.as_str());
        }
    }
    seen.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
INFLUXDB_HOST = "192.168.50.20"
INFLUXDB_PORT = 8086

[[currencies]]
source = ["bitcoin", "ethereum"]
destination = ["usd", "eur"]

[[currencies]]
source = ["monero"]
destination = ["usd"]
"#;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_file_value_wins_over_environment() {
        let env = env_from(&[("INFLUXDB_HOST", "other-host"), ("INFLUXDB_DB_NAME", "crypto")]);
        let settings = Settings::from_toml_str(SAMPLE, env).unwrap();

        assert_eq!(settings.influxdb_host, "192.168.50.20");
        assert_eq!(settings.influxdb_port, 8086);
        assert_eq!(settings.influxdb_db_name, "crypto");
        assert!(!settings.debug);
    }

    #[test]
    fn test_defaults_apply_when_nothing_is_set() {
        let settings = Settings::from_toml_str("", env_from(&[])).unwrap();

        assert_eq!(settings.influxdb_host, "");
        assert_eq!(settings.influxdb_port, 0);
        assert!(settings.currencies.is_empty());
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid { port: 0, .. })));
    }

    #[test]
    fn test_debug_flag_is_case_insensitive() {
        let settings =
            Settings::from_toml_str("DEBUG_FLAG = \"True\"", env_from(&[])).unwrap();
        assert!(settings.debug);

        let settings = Settings::from_toml_str("DEBUG_FLAG = true", env_from(&[])).unwrap();
        assert!(settings.debug);
    }

    #[test]
    fn test_unset_port_fails_validation() {
        let env = env_from(&[("INFLUXDB_HOST", "localhost"), ("INFLUXDB_DB_NAME", "crypto")]);
        let settings = Settings::from_toml_str("", env).unwrap();

        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_non_numeric_port_is_rejected() {
        let env = env_from(&[("INFLUXDB_PORT", "eighty")]);
        let err = Settings::from_toml_str("", env).unwrap_err();

        match err.downcast_ref::<ConfigError>() {
            Some(ConfigError::Malformed { key, value }) => {
                assert_eq!(*key, "INFLUXDB_PORT");
                assert_eq!(value, "eighty");
            }
            other => panic!("expected a malformed port, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_port_from_file_survives_load_context() {
        let dir = std::env::temp_dir()
            .join(format!("crypto_to_influxdb_cfg_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, "INFLUXDB_PORT = \"http\"\n").unwrap();

        let err = Settings::load(&path).unwrap_err();
        fs::remove_dir_all(&dir).ok();

        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Malformed { key: "INFLUXDB_PORT", .. })
        ));
    }

    #[test]
    fn test_pairs_are_cross_product_per_entry() {
        let env = env_from(&[("INFLUXDB_DB_NAME", "crypto")]);
        let settings = Settings::from_toml_str(SAMPLE, env).unwrap();
        assert!(settings.validate().is_ok());

        let names: Vec<String> = settings.pairs().iter().map(|p| p.measurement()).collect();
        assert_eq!(
            names,
            vec![
                "bitcoin_to_usd",
                "bitcoin_to_eur",
                "ethereum_to_usd",
                "ethereum_to_eur",
                "monero_to_usd",
            ]
        );
    }

    #[test]
    fn test_dedup_join_keeps_first_occurrence_order() {
        let values = vec!["usd".to_string(), "eur".to_string(), "usd".to_string()];
        assert_eq!(dedup_join(&values), "usd,eur");
    }
}
