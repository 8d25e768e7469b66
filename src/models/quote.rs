use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which upstream produced a quote.
///
/// `Consensus` marks a quote merged from two or more sources by the resolver;
/// `Simulated` marks the random-walk fallback used when every source is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteSource {
    Coinbase,
    Kraken,
    CoinGecko,
    Consensus,
    Simulated,
}

impl QuoteSource {
    pub fn is_real(&self) -> bool {
        !matches!(self, QuoteSource::Simulated)
    }
}

impl std::fmt::Display for QuoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuoteSource::Coinbase => "coinbase",
            QuoteSource::Kraken => "kraken",
            QuoteSource::CoinGecko => "coingecko",
            QuoteSource::Consensus => "consensus",
            QuoteSource::Simulated => "simulated",
        };
        f.write_str(s)
    }
}

/// A spot market snapshot for one symbol.
///
/// `closes`/`volumes` are the most recent hourly closes, oldest first,
/// capped at 200 entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub volume_24h: f64,
    pub price_change_24h_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
    pub timestamp: DateTime<Utc>,
    pub source: QuoteSource,
}

impl Quote {
    pub fn is_usable(&self) -> bool {
        self.price > 0.0 && self.price.is_finite()
    }
}
