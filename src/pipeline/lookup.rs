use anyhow::Result;
use std::collections::HashSet;

use crate::data::{CoinListing, MarketDataProvider};

/// Provider ids of every listed coin whose ticker matches one of `symbols`,
/// compared case-insensitively, in catalogue order.
pub fn match_symbols(coins: &[CoinListing], symbols: &[String]) -> Vec<String> {
    let wanted: HashSet<String> = symbols.iter().map(|s| s.to_lowercase()).collect();

    coins
        .iter()
        .filter(|coin| wanted.contains(&coin.symbol.to_lowercase()))
        .map(|coin| coin.id.clone())
        .collect()
}

/// Looks up the provider ids for ticker symbols.
///
/// # Arguments
/// * `provider`: Source of the coin catalogue
/// * `symbols`: Ticker symbols, e.g. "BTC" or "xmr"
///
/// # Errors
/// Returns an error if the coin list cannot be fetched
///
/// # Returns
/// Matching ids in catalogue order; several coins may share a symbol
pub async fn find_ids(provider: &dyn MarketDataProvider, symbols: &[String]) -> Result<Vec<String>> {
    let coins = provider.list_coins().await?;
    Ok(match_symbols(&coins, symbols))
}
