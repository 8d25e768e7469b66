//! Kraken public market data.
//!
//! The Ticker endpoint carries last price and 24h aggregates; OHLC supplies
//! the hourly closes. Kraken responds under its own internal pair names
//! (e.g. `XXBTZUSD` for `XBTUSD`), so result maps are read by taking the
//! single entry rather than by key.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::feeds::{kraken_pair, parse_price_field, PriceSource, SourceError, MAX_CLOSES, SOURCE_TIMEOUT};
use crate::models::quote::{Quote, QuoteSource};

const BASE_URL: &str = "https://api.kraken.com";

#[derive(Debug, Deserialize)]
struct KrakenEnvelope<T> {
    error: Vec<String>,
    result: Option<T>,
}

/// Ticker payload: `c` last trade [price, lot], `v` volume [today, 24h],
/// `h`/`l` high/low [today, 24h], `o` today's open.
#[derive(Debug, Deserialize)]
struct TickerInfo {
    c: Vec<String>,
    v: Vec<String>,
    h: Vec<String>,
    l: Vec<String>,
    o: String,
}

pub struct KrakenSource {
    http: reqwest::Client,
    base_url: String,
}

impl Default for KrakenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl KrakenSource {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get_result<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let envelope: KrakenEnvelope<T> = self
            .http
            .get(&url)
            .timeout(SOURCE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !envelope.error.is_empty() {
            return Err(SourceError::Schema(envelope.error.join("; ")));
        }
        envelope
            .result
            .ok_or_else(|| SourceError::Schema("missing result".to_string()))
    }

    fn nth(values: &[String], idx: usize, field: &str) -> Result<f64, SourceError> {
        let raw = values
            .get(idx)
            .ok_or_else(|| SourceError::Schema(format!("{field}: missing index {idx}")))?;
        parse_price_field(raw, field)
    }
}

#[async_trait]
impl PriceSource for KrakenSource {
    fn name(&self) -> &'static str {
        "kraken"
    }

    async fn fetch(&self, symbol: &str) -> Result<Quote, SourceError> {
        let pair = kraken_pair(symbol)?;

        let ticker: HashMap<String, TickerInfo> = self
            .get_result(&format!("/0/public/Ticker?pair={pair}"))
            .await?;
        let info = ticker
            .into_values()
            .next()
            .ok_or_else(|| SourceError::Schema("empty ticker result".to_string()))?;

        let price = Self::nth(&info.c, 0, "c[0]")?;
        let volume_24h = Self::nth(&info.v, 1, "v[1]")?;
        let high_24h = Self::nth(&info.h, 1, "h[1]")?;
        let low_24h = Self::nth(&info.l, 1, "l[1]")?;
        let open = parse_price_field(&info.o, "o")?;

        // OHLC rows: [time, open, high, low, close, vwap, volume, count].
        let ohlc: HashMap<String, Value> = self
            .get_result(&format!("/0/public/OHLC?pair={pair}&interval=60"))
            .await?;
        let mut closes: Vec<f64> = Vec::new();
        let mut volumes: Vec<f64> = Vec::new();
        if let Some(rows) = ohlc.values().find_map(Value::as_array) {
            for row in rows {
                let (Some(close), Some(volume)) = (
                    row.get(4).and_then(Value::as_str),
                    row.get(6).and_then(Value::as_str),
                ) else {
                    continue;
                };
                if let (Ok(c), Ok(v)) = (close.parse::<f64>(), volume.parse::<f64>()) {
                    closes.push(c);
                    volumes.push(v);
                }
            }
        }
        if closes.len() > MAX_CLOSES {
            closes.drain(..closes.len() - MAX_CLOSES);
            volumes.drain(..volumes.len() - MAX_CLOSES);
        }

        let change_pct = if open > 0.0 {
            (price - open) / open * 100.0
        } else {
            0.0
        };

        debug!(symbol, price, "kraken quote");
        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            volume_24h,
            price_change_24h_pct: change_pct,
            high_24h,
            low_24h,
            closes,
            volumes,
            timestamp: Utc::now(),
            source: QuoteSource::Kraken,
        })
    }
}
