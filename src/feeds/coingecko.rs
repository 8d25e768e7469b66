//! CoinGecko public market data.
//!
//! `/simple/price` carries spot, 24h volume and 24h change; the hourly
//! `/market_chart` supplies closes and volumes. CoinGecko has no 24h
//! high/low on these endpoints, so they are taken from the hourly closes.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::feeds::{coingecko_id, PriceSource, SourceError, MAX_CLOSES, SOURCE_TIMEOUT};
use crate::models::quote::{Quote, QuoteSource};

const BASE_URL: &str = "https://api.coingecko.com/api/v3";

#[derive(Debug, Deserialize)]
struct SimplePrice {
    usd: f64,
    #[serde(default)]
    usd_24h_vol: f64,
    #[serde(default)]
    usd_24h_change: f64,
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(i64, f64)>,
    total_volumes: Vec<(i64, f64)>,
}

pub struct CoinGeckoSource {
    http: reqwest::Client,
    base_url: String,
}

impl Default for CoinGeckoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinGeckoSource {
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
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch(&self, symbol: &str) -> Result<Quote, SourceError> {
        let id = coingecko_id(symbol)?;

        let simple: HashMap<String, SimplePrice> = self
            .get_json(&format!(
                "/simple/price?ids={id}&vs_currencies=usd&include_24hr_vol=true&include_24hr_change=true"
            ))
            .await?;
        let entry = simple
            .get(id)
            .ok_or_else(|| SourceError::Schema(format!("missing coin id {id}")))?;

        let chart: MarketChart = self
            .get_json(&format!(
                "/coins/{id}/market_chart?vs_currency=usd&days=1&interval=hourly"
            ))
            .await?;

        let mut closes: Vec<f64> = chart.prices.iter().map(|(_, p)| *p).collect();
        let mut volumes: Vec<f64> = chart.total_volumes.iter().map(|(_, v)| *v).collect();
        if closes.len() > MAX_CLOSES {
            closes.drain(..closes.len() - MAX_CLOSES);
            volumes.drain(..volumes.len() - MAX_CLOSES);
        }

        let high_24h = closes
            .iter()
            .copied()
            .fold(entry.usd, f64::max);
        let low_24h = closes.iter().copied().fold(entry.usd, f64::min);

        debug!(symbol, price = entry.usd, "coingecko quote");
        Ok(Quote {
            symbol: symbol.to_string(),
            price: entry.usd,
            volume_24h: entry.usd_24h_vol,
            price_change_24h_pct: entry.usd_24h_change,
            high_24h,
            low_24h,
            closes,
            volumes,
            timestamp: Utc::now(),
            source: QuoteSource::CoinGecko,
        })
    }
}
