pub mod coinbase;
pub mod coingecko;
pub mod consensus;
pub mod kraken;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::quote::Quote;

/// Per-call HTTP timeout for every upstream request.
pub const SOURCE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Maximum closes/volumes carried on a quote.
pub const MAX_CLOSES: usize = 200;

/// Anything that can go wrong talking to one upstream. All variants are
/// equivalent from the resolver's point of view: the source is unavailable
/// this tick and the other sources carry the consensus.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Schema(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

/// One upstream price provider. Implementations map the canonical symbol to
/// their native form and never panic; every failure is a `SourceError`.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, symbol: &str) -> Result<Quote, SourceError>;
}

/// Kraken's native pair name for a canonical symbol.
pub fn kraken_pair(symbol: &str) -> Result<&'static str, SourceError> {
    let pair = match symbol {
        "BTC-USD" => "XBTUSD",
        "ETH-USD" => "ETHUSD",
        "SOL-USD" => "SOLUSD",
        "USDC-USD" => "USDCUSD",
        "DOGE-USD" => "XDGUSD",
        "XRP-USD" => "XRPUSD",
        "ADA-USD" => "ADAUSD",
        "LINK-USD" => "LINKUSD",
        other => return Err(SourceError::UnknownSymbol(other.to_string())),
    };
    Ok(pair)
}

/// CoinGecko's coin id for a canonical symbol.
pub fn coingecko_id(symbol: &str) -> Result<&'static str, SourceError> {
    let id = match symbol {
        "BTC-USD" => "bitcoin",
        "ETH-USD" => "ethereum",
        "SOL-USD" => "solana",
        "USDC-USD" => "usd-coin",
        "DOGE-USD" => "dogecoin",
        "XRP-USD" => "ripple",
        "ADA-USD" => "cardano",
        "LINK-USD" => "chainlink",
        other => return Err(SourceError::UnknownSymbol(other.to_string())),
    };
    Ok(id)
}

/// Coinbase keeps the dashed product form; only membership is checked.
pub fn coinbase_product(symbol: &str) -> Result<&str, SourceError> {
    // Reuse the CoinGecko table as the canonical symbol registry.
    coingecko_id(symbol)?;
    Ok(symbol)
}

pub(crate) fn parse_price_field(raw: &str, field: &str) -> Result<f64, SourceError> {
    raw.parse::<f64>()
        .map_err(|_| SourceError::Schema(format!("{field}: not a number: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_symbols_translate() {
        assert_eq!(kraken_pair("BTC-USD").unwrap(), "XBTUSD");
        assert_eq!(coingecko_id("SOL-USD").unwrap(), "solana");
        assert_eq!(coinbase_product("ETH-USD").unwrap(), "ETH-USD");
    }

    #[test]
    fn unknown_symbol_fails_fast() {
        assert!(matches!(
            kraken_pair("SHIB-USD"),
            Err(SourceError::UnknownSymbol(_))
        ));
        assert!(matches!(
            coingecko_id("NOPE"),
            Err(SourceError::UnknownSymbol(_))
        ));
    }
}
