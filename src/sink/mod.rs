pub mod influx;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::data::{Precision, PricePoint};

pub use influx::InfluxSink;

/// Destination for price points.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Names of every database on the server.
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn create_database(&self, name: &str) -> Result<()>;

    /// Binds every later write to `name`.
    fn switch_database(&mut self, name: &str);

    /// Writes `points` in requests of at most `batch_size` points each.
    async fn write_points(
        &self,
        points: &[PricePoint],
        precision: Precision,
        batch_size: usize,
    ) -> Result<()>;
}

/// Creates `name` unless it already exists, then switches to it.
///
/// # Arguments
/// * `sink`: Sink to prepare; it is bound to `name` on success
/// * `name`: Database to ensure
///
/// # Errors
/// Returns an error if listing or creating the database fails. The sink is
/// left unswitched in that case.
pub async fn ensure_database(sink: &mut dyn TimeSeriesSink, name: &str) -> Result<()> {
    let existing = sink.list_databases().await?;
    if existing.iter().any(|db| db == name) {
        info!("InfluxDB DB: [{}] exists...", name);
    } else {
        info!("InfluxDB DB: [{}] does not exist. Creating...", name);
        sink.create_database(name).await?;
    }

    info!("Switching InfluxDB to [{}]...", name);
    sink.switch_database(name);
    Ok(())
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        pub Sink {}

        #[async_trait]
        impl TimeSeriesSink for Sink {
            async fn list_databases(&self) -> Result<Vec<String>>;
            async fn create_database(&self, name: &str) -> Result<()>;
            fn switch_database(&mut self, name: &str);
            async fn write_points(
                &self,
                points: &[PricePoint],
                precision: Precision,
                batch_size: usize,
            ) -> Result<()>;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSink;
    use super::*;
    use mockall::Sequence;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_ensure_database_creates_once() {
        let mut sink = MockSink::new();
        let created = Arc::new(Mutex::new(Vec::<String>::new()));

        let seen = Arc::clone(&created);
        sink.expect_list_databases().times(2).returning(move || {
            let mut names = vec!["_internal".to_string()];
            names.extend(seen.lock().unwrap().iter().cloned());
            Ok(names)
        });

        let log = Arc::clone(&created);
        sink.expect_create_database()
            .withf(|name| name == "crypto")
            .times(1)
            .returning(move |name| {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            });

        sink.expect_switch_database()
            .withf(|name| name == "crypto")
            .times(2)
            .return_const(());

        ensure_database(&mut sink, "crypto").await.unwrap();
        ensure_database(&mut sink, "crypto").await.unwrap();

        assert_eq!(*created.lock().unwrap(), vec!["crypto".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_database_switches_after_listing() {
        let mut sink = MockSink::new();
        let mut seq = Sequence::new();

        sink.expect_list_databases()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec!["crypto".to_string()]));
        sink.expect_create_database().never();
        sink.expect_switch_database()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        ensure_database(&mut sink, "crypto").await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_database_propagates_list_failure() {
        let mut sink = MockSink::new();
        sink.expect_list_databases()
            .returning(|| Err(anyhow::anyhow!("connection refused")));
        sink.expect_switch_database().never();

        assert!(ensure_database(&mut sink, "crypto").await.is_err());
    }
}
