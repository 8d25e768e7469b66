//! Redundant quote resolution across independent price sources.
//!
//! All sources are polled concurrently; the per-field median of the healthy
//! responses becomes the consensus. With a single survivor the quote passes
//! through untouched, and with none a simulated random-walk quote keeps the
//! control loop alive (clearly tagged so nothing downstream mistakes it for
//! market data).

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::feeds::coinbase::CoinbaseSource;
use crate::feeds::coingecko::CoinGeckoSource;
use crate::feeds::kraken::KrakenSource;
use crate::feeds::PriceSource;
use crate::models::quote::{Quote, QuoteSource};

/// Total fan-out budget per symbol per tick.
pub const FETCH_BUDGET: Duration = Duration::from_secs(10);

/// Simulated fallback walks at most this far from the last seen price.
const SIMULATED_STEP_PCT: f64 = 0.02;

pub struct QuoteResolver {
    sources: Vec<Arc<dyn PriceSource>>,
    last_price: RwLock<HashMap<String, f64>>,
    failures: DashMap<&'static str, u64>,
    fetch_budget: Duration,
}

impl QuoteResolver {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>) -> Self {
        Self {
            sources,
            last_price: RwLock::new(HashMap::new()),
            failures: DashMap::new(),
            fetch_budget: FETCH_BUDGET,
        }
    }

    /// Resolver over the three production sources.
    pub fn with_default_sources() -> Self {
        Self::new(vec![
            Arc::new(CoinbaseSource::new()) as Arc<dyn PriceSource>,
            Arc::new(KrakenSource::new()),
            Arc::new(CoinGeckoSource::new()),
        ])
    }

    /// Cumulative failure count per source, for tick status lines.
    pub fn failure_counts(&self) -> Vec<(&'static str, u64)> {
        self.failures
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Fetch from every source concurrently and merge to a consensus quote.
    /// Never fails: with zero usable responses a simulated quote is returned.
    pub async fn fetch_consensus(&self, symbol: &str) -> Quote {
        let mut in_flight: FuturesUnordered<_> = self
            .sources
            .iter()
            .map(|source| {
                let source = Arc::clone(source);
                let symbol = symbol.to_string();
                async move {
                    let result = source.fetch(&symbol).await;
                    (source.name(), result)
                }
            })
            .collect();

        // Responses accumulate in arrival order; that order breaks median
        // ties later.
        let mut quotes: Vec<Quote> = Vec::with_capacity(self.sources.len());
        let deadline = tokio::time::sleep(self.fetch_budget);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = in_flight.next() => match next {
                    Some((name, Ok(quote))) if quote.is_usable() => {
                        debug!(symbol, source = name, price = quote.price, "source ok");
                        quotes.push(quote);
                    }
                    Some((name, Ok(quote))) => {
                        self.record_failure(name);
                        warn!(symbol, source = name, price = quote.price, "unusable quote");
                    }
                    Some((name, Err(err))) => {
                        self.record_failure(name);
                        warn!(symbol, source = name, %err, "source unavailable");
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(symbol, "fetch budget expired, proceeding with partial responses");
                    break;
                }
            }
        }

        let quote = match quotes.len() {
            0 => self.simulated_quote(symbol).await,
            1 => quotes.remove(0),
            _ => Self::merge(symbol, quotes),
        };

        self.last_price
            .write()
            .await
            .insert(symbol.to_string(), quote.price);
        quote
    }

    fn record_failure(&self, name: &'static str) {
        *self.failures.entry(name).or_insert(0) += 1;
    }

    /// Per-field median merge. The response closest to the median price
    /// donates every non-scalar field.
    fn merge(symbol: &str, mut quotes: Vec<Quote>) -> Quote {
        let median_price = median(quotes.iter().map(|q| q.price));
        let median_volume = median(quotes.iter().map(|q| q.volume_24h));
        let median_change = median(quotes.iter().map(|q| q.price_change_24h_pct));

        // First arrival wins ties on distance to the median.
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (i, quote) in quotes.iter().enumerate() {
            let distance = (quote.price - median_price).abs();
            if distance < best_distance {
                best_distance = distance;
                best = i;
            }
        }
        debug!(
            symbol,
            price = median_price,
            sources = quotes.len(),
            "consensus merged"
        );
        let closest = quotes.swap_remove(best);
        Quote {
            price: median_price,
            volume_24h: median_volume,
            price_change_24h_pct: median_change,
            timestamp: Utc::now(),
            source: QuoteSource::Consensus,
            ..closest
        }
    }

    /// Random walk from the last seen consensus price. The walk continues
    /// across consecutive fallbacks because the simulated price is stored
    /// back as the last observation.
    async fn simulated_quote(&self, symbol: &str) -> Quote {
        let base = self
            .last_price
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or_else(|| seed_price(symbol));

        let mut rng = rand::thread_rng();
        let step = rng.gen_range(-SIMULATED_STEP_PCT..=SIMULATED_STEP_PCT);
        let price = (base * (1.0 + step)).max(f64::MIN_POSITIVE);
        let volume_24h = rng.gen_range(1_000_000.0..50_000_000.0);

        let mut closes = Vec::with_capacity(24);
        let mut walk = base;
        for _ in 0..24 {
            walk *= 1.0 + rng.gen_range(-SIMULATED_STEP_PCT..=SIMULATED_STEP_PCT);
            closes.push(walk);
        }
        let volumes: Vec<f64> = (0..closes.len())
            .map(|_| rng.gen_range(1_000_000.0..50_000_000.0))
            .collect();

        let high = closes.iter().copied().fold(price, f64::max);
        let low = closes.iter().copied().fold(price, f64::min);

        warn!(symbol, price, "all sources down, using simulated quote");
        Quote {
            symbol: symbol.to_string(),
            price,
            volume_24h,
            price_change_24h_pct: step * 100.0,
            high_24h: high,
            low_24h: low,
            closes,
            volumes,
            timestamp: Utc::now(),
            source: QuoteSource::Simulated,
        }
    }

    #[cfg(test)]
    fn with_budget(mut self, budget: Duration) -> Self {
        self.fetch_budget = budget;
        self
    }
}

/// Median as an element of the set: the lower middle value for even counts,
/// so a consensus price is always one some source actually reported.
fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return 0.0;
    }
    sorted[(sorted.len() - 1) / 2]
}

/// Anchor for the simulated walk before any real price has been seen.
fn seed_price(symbol: &str) -> f64 {
    match symbol {
        "BTC-USD" => 90_000.0,
        "ETH-USD" => 3_000.0,
        "SOL-USD" => 150.0,
        "USDC-USD" => 1.0,
        "DOGE-USD" => 0.30,
        "XRP-USD" => 2.0,
        "ADA-USD" => 1.0,
        "LINK-USD" => 20.0,
        _ => 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::SourceError;
    use async_trait::async_trait;

    struct StaticSource {
        name: &'static str,
        price: f64,
        volume: f64,
        change: f64,
        delay: Duration,
        fail: bool,
    }

    impl StaticSource {
        fn ok(name: &'static str, price: f64, volume: f64, change: f64) -> Arc<dyn PriceSource> {
            Arc::new(Self {
                name,
                price,
                volume,
                change,
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn down(name: &'static str) -> Arc<dyn PriceSource> {
            Arc::new(Self {
                name,
                price: 0.0,
                volume: 0.0,
                change: 0.0,
                delay: Duration::ZERO,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl PriceSource for StaticSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, symbol: &str) -> Result<Quote, SourceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(SourceError::Schema("down".to_string()));
            }
            Ok(Quote {
                symbol: symbol.to_string(),
                price: self.price,
                volume_24h: self.volume,
                price_change_24h_pct: self.change,
                high_24h: self.price * 1.01,
                low_24h: self.price * 0.99,
                closes: vec![self.price; 5],
                volumes: vec![self.volume; 5],
                timestamp: Utc::now(),
                source: QuoteSource::Coinbase,
            })
        }
    }

    #[tokio::test]
    async fn three_sources_yield_field_medians() {
        let resolver = QuoteResolver::new(vec![
            StaticSource::ok("a", 90_000.0, 100.0, 1.0),
            StaticSource::ok("b", 91_000.0, 120.0, 2.0),
            StaticSource::ok("c", 100_000.0, 500.0, 9.0),
        ]);
        let quote = resolver.fetch_consensus("BTC-USD").await;
        assert_eq!(quote.price, 91_000.0);
        assert_eq!(quote.volume_24h, 120.0);
        assert_eq!(quote.price_change_24h_pct, 2.0);
        assert_eq!(quote.source, QuoteSource::Consensus);
    }

    #[tokio::test]
    async fn two_sources_elect_a_reported_price() {
        let resolver = QuoteResolver::new(vec![
            StaticSource::ok("a", 90_000.0, 100.0, 1.0),
            StaticSource::ok("b", 91_000.0, 120.0, 2.0),
            StaticSource::down("c"),
        ]);
        let quote = resolver.fetch_consensus("BTC-USD").await;
        // Lower-middle median: the consensus price is an observed one,
        // never a synthesized midpoint.
        assert_eq!(quote.price, 90_000.0);
        assert_eq!(quote.volume_24h, 100.0);
        assert_eq!(quote.source, QuoteSource::Consensus);
    }

    #[tokio::test]
    async fn single_survivor_passes_through() {
        let resolver = QuoteResolver::new(vec![
            StaticSource::down("a"),
            StaticSource::ok("b", 91_000.0, 120.0, 2.0),
            StaticSource::down("c"),
        ]);
        let quote = resolver.fetch_consensus("BTC-USD").await;
        assert_eq!(quote.price, 91_000.0);
        assert_eq!(quote.source, QuoteSource::Coinbase);
        assert_eq!(resolver.failure_counts().len(), 2);
    }

    #[tokio::test]
    async fn all_down_yields_tagged_simulated_quote() {
        let resolver = QuoteResolver::new(vec![
            StaticSource::down("a"),
            StaticSource::down("b"),
            StaticSource::down("c"),
        ]);
        let quote = resolver.fetch_consensus("BTC-USD").await;
        assert_eq!(quote.source, QuoteSource::Simulated);
        assert!(quote.price > 0.0);
        // The walk stays within one step of the seed.
        assert!((quote.price - 90_000.0).abs() <= 90_000.0 * SIMULATED_STEP_PCT + 1e-9);
    }

    #[tokio::test]
    async fn simulated_walk_continues_from_last_consensus() {
        let live = QuoteResolver::new(vec![StaticSource::ok("a", 50_000.0, 10.0, 0.0)]);
        let first = live.fetch_consensus("BTC-USD").await;
        assert_eq!(first.price, 50_000.0);
        assert_eq!(first.source, QuoteSource::Coinbase);
        // Same resolver, sources now considered down is not expressible with
        // static fakes, so check the stored anchor directly instead.
        let anchor = live.last_price.read().await.get("BTC-USD").copied();
        assert_eq!(anchor, Some(50_000.0));
    }

    #[tokio::test]
    async fn budget_expiry_falls_back_to_partial_set() {
        let slow: Arc<dyn PriceSource> = Arc::new(StaticSource {
            name: "slow",
            price: 95_000.0,
            volume: 1.0,
            change: 0.0,
            delay: Duration::from_millis(500),
            fail: false,
        });
        let resolver = QuoteResolver::new(vec![
            StaticSource::ok("fast", 91_000.0, 120.0, 2.0),
            slow,
        ])
        .with_budget(Duration::from_millis(50));
        let quote = resolver.fetch_consensus("BTC-USD").await;
        // The slow source missed the budget; the fast one stands alone.
        assert_eq!(quote.price, 91_000.0);
    }

    #[test]
    fn median_prefers_lower_middle_on_even_counts() {
        assert_eq!(median([90_000.0, 91_000.0].into_iter()), 90_000.0);
        assert_eq!(median([3.0, 1.0, 2.0].into_iter()), 2.0);
        assert_eq!(median(std::iter::empty()), 0.0);
    }
}
