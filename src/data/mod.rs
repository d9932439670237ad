pub mod ingestion;
pub mod processing;

pub use ingestion::{CoinGeckoClient, CoinListing, CurrencyPair, MarketDataProvider};
pub use processing::{merge_windows, Precision, PricePoint, BACKFILL_WINDOWS};
