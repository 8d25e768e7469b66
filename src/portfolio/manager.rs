//! Target-weight multi-asset allocator with a weekly rebalance cadence.
//!
//! Runs alongside the symbol-level trader on its own schedule. Holdings are
//! quantities per asset plus an unallocated cash bucket that the first
//! rebalance sweeps into the allocation. The stable reserve (USDC) counts in
//! the weights but stays out of correlation averages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PortfolioConfig;
use crate::feeds::consensus::QuoteResolver;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub timestamp: DateTime<Utc>,
    /// Pre-rebalance deviation from target per asset.
    pub deviations: HashMap<String, f64>,
    /// Pairwise return correlations of the non-stable assets.
    pub correlations: Vec<(String, String, f64)>,
    pub total_value: f64,
    /// False when every weight was already inside the threshold.
    pub acted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiversificationMetrics {
    pub avg_correlation: f64,
    pub allocation_deviation: f64,
    pub portfolio_value: f64,
    pub days_since_rebalance: i64,
}

pub struct PortfolioManager {
    config: PortfolioConfig,
    resolver: Arc<QuoteResolver>,
    /// Quantity per asset; the stable reserve is quoted at ~$1 so its
    /// quantity doubles as dollars.
    pub holdings: HashMap<String, f64>,
    /// Capital not yet swept into the allocation.
    cash: f64,
    price_history: HashMap<String, VecDeque<f64>>,
    latest_prices: HashMap<String, f64>,
    current_weights: HashMap<String, f64>,
    last_rebalance: DateTime<Utc>,
    events: Vec<RebalanceEvent>,
}

impl PortfolioManager {
    pub fn new(config: PortfolioConfig, resolver: Arc<QuoteResolver>, initial_capital: f64) -> Self {
        let mut holdings = HashMap::new();
        let mut cash = initial_capital;
        // Seed the stable reserve immediately; risk assets wait for prices.
        for (symbol, weight) in &config.target_weights {
            if is_stable(symbol) {
                let reserve = initial_capital * weight;
                holdings.insert(symbol.clone(), reserve);
                cash -= reserve;
            } else {
                holdings.insert(symbol.clone(), 0.0);
            }
        }
        let price_history = config
            .target_weights
            .iter()
            .map(|(s, _)| (s.clone(), VecDeque::with_capacity(config.history_cap)))
            .collect();
        Self {
            config,
            resolver,
            holdings,
            cash,
            price_history,
            latest_prices: HashMap::new(),
            current_weights: HashMap::new(),
            last_rebalance: Utc::now(),
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[RebalanceEvent] {
        &self.events
    }

    pub fn current_weights(&self) -> &HashMap<String, f64> {
        &self.current_weights
    }

    /// Fetch consensus quotes for every asset, then revalue.
    pub async fn update_value(&mut self) -> f64 {
        let mut prices = HashMap::new();
        for (symbol, _) in self.config.target_weights.clone() {
            let quote = self.resolver.fetch_consensus(&symbol).await;
            prices.insert(symbol, quote.price);
        }
        self.revalue(&prices)
    }

    /// Recompute total value, current weights and per-asset history from the
    /// given prices. Pure bookkeeping, shared by the live path and tests.
    pub fn revalue(&mut self, prices: &HashMap<String, f64>) -> f64 {
        for (symbol, price) in prices {
            if *price <= 0.0 {
                continue;
            }
            self.latest_prices.insert(symbol.clone(), *price);
            if let Some(history) = self.price_history.get_mut(symbol) {
                if history.len() >= self.config.history_cap {
                    history.pop_front();
                }
                history.push_back(*price);
            }
        }

        let total = self.total_value();
        self.current_weights.clear();
        if total > 0.0 {
            for (symbol, quantity) in &self.holdings {
                let price = self.latest_prices.get(symbol).copied().unwrap_or(0.0);
                self.current_weights
                    .insert(symbol.clone(), quantity * price / total);
            }
        }
        total
    }

    fn total_value(&self) -> f64 {
        let mut total = self.cash;
        for (symbol, quantity) in &self.holdings {
            let price = self.latest_prices.get(symbol).copied().unwrap_or(0.0);
            total += quantity * price;
        }
        total
    }

    /// True once the rebalance interval has elapsed.
    pub fn should_rebalance(&self) -> bool {
        (Utc::now() - self.last_rebalance).num_days() >= self.config.rebalance_interval_days
    }

    /// Reset every holding to its target weight, but only when some weight
    /// deviates at least the threshold; otherwise record a no-op event and
    /// leave holdings and the rebalance clock untouched.
    pub fn rebalance(&mut self) -> RebalanceEvent {
        let total = self.total_value();
        let mut deviations = HashMap::new();
        let mut max_deviation = 0.0f64;
        for (symbol, target) in &self.config.target_weights {
            let current = self.current_weights.get(symbol).copied().unwrap_or(0.0);
            let deviation = current - target;
            max_deviation = max_deviation.max(deviation.abs());
            deviations.insert(symbol.clone(), deviation);
        }

        let correlations = self.pairwise_correlations();
        let acted = max_deviation >= self.config.deviation_threshold && total > 0.0;

        if acted {
            for (symbol, target) in self.config.target_weights.clone() {
                let price = self.latest_prices.get(&symbol).copied().unwrap_or(0.0);
                if price <= 0.0 {
                    warn!(symbol, "no price for rebalance, leaving holding as-is");
                    continue;
                }
                let target_value = total * target;
                self.holdings.insert(symbol, target_value / price);
            }
            self.cash = 0.0;
            self.last_rebalance = Utc::now();
            info!(
                total,
                max_deviation_pct = max_deviation * 100.0,
                "portfolio rebalanced to target weights"
            );
        } else {
            info!(
                max_deviation_pct = max_deviation * 100.0,
                "weights within threshold, rebalance skipped"
            );
        }

        let event = RebalanceEvent {
            timestamp: Utc::now(),
            deviations,
            correlations,
            total_value: total,
            acted,
        };
        self.events.push(event.clone());
        event
    }

    /// Pearson correlation of simple returns over the last aligned window.
    /// Degenerate series (flat, short, or zero variance) yield 0.
    pub fn correlation(&self, a: &str, b: &str) -> f64 {
        let (Some(ha), Some(hb)) = (self.price_history.get(a), self.price_history.get(b)) else {
            return 0.0;
        };
        let n = ha.len().min(hb.len()).min(self.config.correlation_window + 1);
        if n < 3 {
            return 0.0;
        }
        let returns = |h: &VecDeque<f64>| -> Vec<f64> {
            let slice: Vec<f64> = h.iter().rev().take(n).rev().copied().collect();
            slice
                .windows(2)
                .map(|p| if p[0] != 0.0 { (p[1] - p[0]) / p[0] } else { 0.0 })
                .collect()
        };
        pearson(&returns(ha), &returns(hb))
    }

    fn pairwise_correlations(&self) -> Vec<(String, String, f64)> {
        let risk_assets: Vec<&String> = self
            .config
            .target_weights
            .iter()
            .map(|(s, _)| s)
            .filter(|s| !is_stable(s))
            .collect();
        let mut out = Vec::new();
        for (i, a) in risk_assets.iter().enumerate() {
            for b in risk_assets.iter().skip(i + 1) {
                out.push(((*a).clone(), (*b).clone(), self.correlation(a, b)));
            }
        }
        out
    }

    pub fn diversification_metrics(&self) -> DiversificationMetrics {
        let correlations = self.pairwise_correlations();
        let avg_correlation = if correlations.is_empty() {
            0.0
        } else {
            correlations.iter().map(|(_, _, c)| c.abs()).sum::<f64>() / correlations.len() as f64
        };
        let allocation_deviation = self
            .config
            .target_weights
            .iter()
            .map(|(symbol, target)| {
                (self.current_weights.get(symbol).copied().unwrap_or(0.0) - target).abs()
            })
            .sum();
        DiversificationMetrics {
            avg_correlation,
            allocation_deviation,
            portfolio_value: self.total_value(),
            days_since_rebalance: (Utc::now() - self.last_rebalance).num_days(),
        }
    }

    /// Drive one check cycle: refresh values, rebalance when due.
    pub async fn run_cycle(&mut self) {
        let total = self.update_value().await;
        info!(total, "portfolio value updated");
        if self.should_rebalance() {
            self.rebalance();
        }
    }

    #[cfg(test)]
    fn set_last_rebalance(&mut self, when: DateTime<Utc>) {
        self.last_rebalance = when;
    }
}

fn is_stable(symbol: &str) -> bool {
    symbol.starts_with("USDC") || symbol.starts_with("USDT")
}

/// NaN-guarded Pearson correlation.
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let xs = &xs[..n];
    let ys = &ys[..n];
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    cov / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn manager() -> PortfolioManager {
        let resolver = Arc::new(QuoteResolver::new(Vec::new()));
        PortfolioManager::new(PortfolioConfig::default(), resolver, 10_000.0)
    }

    fn fixture_prices() -> HashMap<String, f64> {
        let mut prices = HashMap::new();
        prices.insert("BTC-USD".to_string(), 90_000.0);
        prices.insert("ETH-USD".to_string(), 3_000.0);
        prices.insert("SOL-USD".to_string(), 150.0);
        prices.insert("USDC-USD".to_string(), 1.0);
        prices
    }

    #[test]
    fn stable_reserve_is_seeded_at_construction() {
        let pm = manager();
        assert!((pm.holdings["USDC-USD"] - 1500.0).abs() < 1e-9);
        assert!((pm.cash - 8500.0).abs() < 1e-9);
        let weight_sum: f64 = PortfolioConfig::default()
            .target_weights
            .iter()
            .map(|(_, w)| w)
            .sum();
        assert!((weight_sum - 1.0).abs() < 1e-3);
    }

    #[test]
    fn should_rebalance_after_seven_days() {
        let mut pm = manager();
        assert!(!pm.should_rebalance());
        pm.set_last_rebalance(Utc::now() - Duration::days(6));
        assert!(!pm.should_rebalance());
        pm.set_last_rebalance(Utc::now() - Duration::days(7));
        assert!(pm.should_rebalance());
        pm.set_last_rebalance(Utc::now() - Duration::days(14));
        assert!(pm.should_rebalance());
    }

    #[test]
    fn rebalance_lands_on_target_weights() {
        let mut pm = manager();
        // Everything crammed into BTC.
        pm.cash = 0.0;
        pm.holdings.insert("BTC-USD".to_string(), 0.1);
        pm.holdings.insert("ETH-USD".to_string(), 0.0);
        pm.holdings.insert("SOL-USD".to_string(), 0.0);
        pm.holdings.insert("USDC-USD".to_string(), 0.0);
        pm.set_last_rebalance(Utc::now() - Duration::days(8));

        let prices = fixture_prices();
        pm.revalue(&prices);
        let event = pm.rebalance();
        assert!(event.acted);

        pm.revalue(&prices);
        for (symbol, target) in &PortfolioConfig::default().target_weights {
            let current = pm.current_weights()[symbol];
            assert!(
                (current - target).abs() < 0.02,
                "{symbol}: weight {current} too far from {target}"
            );
        }
        assert!(!event.correlations.is_empty());
    }

    #[test]
    fn rebalance_within_threshold_is_a_no_op() {
        let mut pm = manager();
        // Holdings exactly at target for a 10k book.
        pm.cash = 0.0;
        pm.holdings.insert("BTC-USD".to_string(), 4000.0 / 90_000.0);
        pm.holdings.insert("ETH-USD".to_string(), 3000.0 / 3_000.0);
        pm.holdings.insert("SOL-USD".to_string(), 1500.0 / 150.0);
        pm.holdings.insert("USDC-USD".to_string(), 1500.0);
        pm.set_last_rebalance(Utc::now() - Duration::days(8));

        let prices = fixture_prices();
        pm.revalue(&prices);
        let before = pm.holdings.clone();
        let was_due = pm.last_rebalance;
        let event = pm.rebalance();

        assert!(!event.acted);
        assert_eq!(pm.holdings, before);
        assert_eq!(pm.last_rebalance, was_due);
    }

    #[test]
    fn correlation_tracks_synchronized_series() {
        let mut pm = manager();
        for i in 0..30 {
            let mut prices = HashMap::new();
            prices.insert("BTC-USD".to_string(), 90_000.0 + i as f64 * 100.0);
            prices.insert("ETH-USD".to_string(), 3_000.0 + i as f64 * 3.0);
            prices.insert("SOL-USD".to_string(), 150.0 * (1.0 + 0.01 * (i as f64 * 1.7).sin()));
            prices.insert("USDC-USD".to_string(), 1.0);
            pm.revalue(&prices);
        }
        let corr = pm.correlation("BTC-USD", "ETH-USD");
        assert!(corr > 0.8, "expected strong correlation, got {corr}");
        // Flat USDC has zero return variance: guarded to 0.
        assert_eq!(pm.correlation("BTC-USD", "USDC-USD"), 0.0);
    }

    #[test]
    fn diversification_metrics_are_complete() {
        let mut pm = manager();
        for i in 0..30 {
            let mut prices = fixture_prices();
            prices.insert("BTC-USD".to_string(), 90_000.0 + i as f64 * 100.0);
            prices.insert("ETH-USD".to_string(), 3_000.0 + i as f64 * 3.0);
            pm.revalue(&prices);
        }
        let metrics = pm.diversification_metrics();
        assert!(metrics.avg_correlation >= 0.0);
        assert!(metrics.allocation_deviation >= 0.0);
        assert!(metrics.portfolio_value > 0.0);
        assert!(metrics.days_since_rebalance >= 0);
    }
}
