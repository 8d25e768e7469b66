//! Coinbase Exchange public market data.
//!
//! Three read-only endpoints per fetch: `/ticker` for the last trade,
//! `/stats` for the 24h aggregates, `/candles` for hourly closes.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::feeds::{coinbase_product, parse_price_field, PriceSource, SourceError, MAX_CLOSES, SOURCE_TIMEOUT};
use crate::models::quote::{Quote, QuoteSource};

const BASE_URL: &str = "https://api.exchange.coinbase.com";

#[derive(Debug, Deserialize)]
struct Ticker {
    price: String,
}

#[derive(Debug, Deserialize)]
struct Stats {
    open: String,
    high: String,
    low: String,
    volume: String,
}

pub struct CoinbaseSource {
    http: reqwest::Client,
    base_url: String,
}

impl Default for CoinbaseSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinbaseSource {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header("User-Agent", "vigil/0.1")
            .timeout(SOURCE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PriceSource for CoinbaseSource {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn fetch(&self, symbol: &str) -> Result<Quote, SourceError> {
        let product = coinbase_product(symbol)?;

        let ticker: Ticker = self.get_json(&format!("/products/{product}/ticker")).await?;
        let stats: Stats = self.get_json(&format!("/products/{product}/stats")).await?;
        // Candle rows arrive newest first: [ts, low, high, open, close, volume].
        let candles: Vec<[f64; 6]> = self
            .get_json(&format!("/products/{product}/candles?granularity=3600"))
            .await?;

        let price = parse_price_field(&ticker.price, "ticker.price")?;
        let open = parse_price_field(&stats.open, "stats.open")?;
        let high = parse_price_field(&stats.high, "stats.high")?;
        let low = parse_price_field(&stats.low, "stats.low")?;
        let volume = parse_price_field(&stats.volume, "stats.volume")?;

        let mut closes: Vec<f64> = candles.iter().map(|row| row[4]).collect();
        let mut volumes: Vec<f64> = candles.iter().map(|row| row[5]).collect();
        closes.reverse();
        volumes.reverse();
        if closes.len() > MAX_CLOSES {
            closes.drain(..closes.len() - MAX_CLOSES);
            volumes.drain(..volumes.len() - MAX_CLOSES);
        }

        let change_pct = if open > 0.0 {
            (price - open) / open * 100.0
        } else {
            0.0
        };

        debug!(symbol, price, "coinbase quote");
        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            volume_24h: volume,
            price_change_24h_pct: change_pct,
            high_24h: high,
            low_24h: low,
            closes,
            volumes,
            timestamp: Utc::now(),
            source: QuoteSource::Coinbase,
        })
    }
}
