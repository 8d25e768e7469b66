//! Fixed-interval control loop.
//!
//! Each tick, in order: consensus quotes for every symbol (fetched
//! concurrently), risk evaluation, forced liquidation if demanded, the exit
//! chain for open positions, signal generation, ranked entry execution, peak
//! update, and the snapshot cadence. The portfolio, histories and risk state
//! are owned here and touched by no other task.

use futures_util::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::feeds::consensus::QuoteResolver;
use crate::models::position::TradeReason;
use crate::models::quote::QuoteSource;
use crate::models::signal::{Action, Signal};
use crate::risk::position_manager::PositionManager;
use crate::risk::risk_manager::{RiskLevel, RiskManager, RiskSnapshot};
use crate::risk::sizing::Sizing;
use crate::signals::generator::SignalGenerator;
use crate::telemetry::alerts::AlertManager;
use crate::telemetry::report::SessionReport;
use crate::telemetry::snapshot::{SessionSnapshot, SnapshotWriter};

/// Per-symbol consensus price history depth.
pub const HISTORY_CAP: usize = 200;

enum TickOutcome {
    Continue,
    Shutdown,
}

pub struct Scheduler {
    config: Config,
    resolver: Arc<QuoteResolver>,
    generator: SignalGenerator,
    risk: RiskManager,
    positions: PositionManager,
    histories: HashMap<String, VecDeque<f64>>,
    snapshots: SnapshotWriter,
    alerts: Arc<AlertManager>,
    iteration: u64,
    last_risk_level: RiskLevel,
}

impl Scheduler {
    pub fn new(config: Config, resolver: Arc<QuoteResolver>, alerts: Arc<AlertManager>) -> Self {
        let histories = config
            .engine
            .symbols
            .iter()
            .map(|s| (s.clone(), VecDeque::with_capacity(HISTORY_CAP)))
            .collect();
        Self {
            risk: RiskManager::new(config.risk.clone()),
            positions: PositionManager::new(config.engine.clone()),
            generator: SignalGenerator::new(),
            snapshots: SnapshotWriter::new(&config.telemetry.snapshot_dir),
            histories,
            resolver,
            alerts,
            config,
            iteration: 0,
            last_risk_level: RiskLevel::Ok,
        }
    }

    /// Drive ticks until the duration expires, risk forces a shutdown, or the
    /// cancellation signal arrives. Cancellation is only observed at the
    /// inter-tick await, so an in-flight tick always finishes its risk and
    /// exit work. A final snapshot is written on every path out.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.engine.tick_interval_s));
        // Absolute schedule: an overrun fires the next tick immediately
        // instead of skipping it.
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let deadline = if self.config.engine.duration_s > 0 {
            Some(
                tokio::time::Instant::now()
                    + std::time::Duration::from_secs(self.config.engine.duration_s),
            )
        } else {
            None
        };

        let run_result = loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => {
                    info!("cancellation received, stopping after final snapshot");
                    break Ok(());
                }
            }

            self.iteration += 1;
            match self.tick().await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Shutdown) => {
                    error!("risk shutdown, stopping");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    info!("configured duration reached");
                    break Ok(());
                }
            }
        };

        self.persist_snapshot();
        SessionReport::log(
            &self.positions.portfolio,
            self.latest_value(),
            self.risk.events(),
            self.iteration,
        );
        run_result
    }

    async fn tick(&mut self) -> anyhow::Result<TickOutcome> {
        let symbols = self.config.engine.symbols.clone();

        // Quote fan-out. The resolver bounds each symbol's fetches; a symbol
        // whose sources are all down still yields a (simulated) price.
        let quotes = join_all(
            symbols
                .iter()
                .map(|symbol| self.resolver.fetch_consensus(symbol)),
        )
        .await;

        let mut prices: HashMap<String, f64> = HashMap::new();
        let mut degraded = 0usize;
        for quote in &quotes {
            if quote.source == QuoteSource::Simulated {
                degraded += 1;
            }
            prices.insert(quote.symbol.clone(), quote.price);
            let history = self
                .histories
                .entry(quote.symbol.clone())
                .or_insert_with(|| VecDeque::with_capacity(HISTORY_CAP));
            if history.len() >= HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(quote.price);
        }

        // Risk strictly precedes exit processing, which precedes entries.
        let value = self.positions.portfolio_value(&prices);
        // The first configured symbol is the primary one; its history feeds
        // the black-swan detectors.
        let primary_history: Vec<f64> = symbols
            .first()
            .and_then(|s| self.histories.get(s))
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        let verdict = self.risk.evaluate(&RiskSnapshot {
            portfolio_value: value,
            peak_value: self.positions.portfolio.peak_value,
            initial_capital: self.positions.portfolio.initial_capital,
            price_history: &primary_history,
        });

        info!(
            iteration = self.iteration,
            risk = %verdict.level,
            portfolio_value = value,
            cash = self.positions.portfolio.cash,
            open_positions = self.positions.portfolio.positions.len(),
            degraded_symbols = degraded,
            "tick"
        );

        if verdict.level != self.last_risk_level {
            if verdict.level != RiskLevel::Ok {
                self.alerts
                    .on_risk(verdict.level, &format!("portfolio value {value:.2}"))
                    .await;
            }
            self.last_risk_level = verdict.level;
        }

        if verdict.liquidate && !self.positions.portfolio.positions.is_empty() {
            warn!("risk liquidation: closing all open positions");
            for fill in self.positions.liquidate_all(&prices, TradeReason::KillSwitch) {
                self.alerts.on_close(&fill).await;
            }
        }

        // Per-symbol signals, then the exit chain for whatever is open.
        let signals: HashMap<String, Signal> = symbols
            .iter()
            .filter_map(|symbol| {
                let history = self.histories.get(symbol)?;
                let closes: Vec<f64> = history.iter().copied().collect();
                Some((symbol.clone(), self.generator.evaluate(&closes)))
            })
            .collect();

        let open_symbols: Vec<String> =
            self.positions.portfolio.positions.keys().cloned().collect();
        for symbol in open_symbols {
            let (Some(price), Some(signal)) = (prices.get(&symbol), signals.get(&symbol)) else {
                continue;
            };
            if let Some(fill) = self.positions.evaluate_exits(&symbol, *price, signal) {
                self.alerts.on_close(&fill).await;
            }
        }

        if verdict.allow_entries && !verdict.liquidate {
            self.execute_entries(&prices, &signals, verdict.size_multiplier)
                .await;
        }

        if let Err(violation) = self.positions.assert_invariants() {
            error!(%violation, "halting on internal invariant violation");
            self.persist_snapshot();
            return Err(violation);
        }

        // Peak ratchet runs last, whatever the risk state did.
        let end_value = self.positions.portfolio_value(&prices);
        self.positions.update_peak(end_value);

        if self.config.engine.snapshot_every > 0
            && self.iteration % self.config.engine.snapshot_every == 0
        {
            self.persist_snapshot();
        }

        if verdict.shutdown {
            return Ok(TickOutcome::Shutdown);
        }
        Ok(TickOutcome::Continue)
    }

    /// Rank entry-worthy signals and execute in descending score until the
    /// position cap bites. Pure closes (SELL against an open long) skip the
    /// entry gate; anything that opens a position passes through it.
    async fn execute_entries(
        &mut self,
        prices: &HashMap<String, f64>,
        signals: &HashMap<String, Signal>,
        size_multiplier: f64,
    ) {
        let mut candidates: Vec<(String, f64)> = signals
            .iter()
            .filter(|(_, signal)| signal.action != Action::Hold)
            .filter(|(_, signal)| signal.confidence >= self.config.engine.min_entry_confidence)
            .map(|(symbol, signal)| {
                let boost = self
                    .config
                    .engine
                    .priority_boost
                    .get(symbol)
                    .copied()
                    .unwrap_or(1.0);
                let score = Sizing::opportunity_score(
                    signal.confidence,
                    signal.indicators.volatility_pct,
                    boost,
                );
                (symbol.clone(), score)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (symbol, _score) in candidates {
            let (Some(price), Some(signal)) = (prices.get(&symbol), signals.get(&symbol)) else {
                continue;
            };

            let opens_position = match signal.action {
                Action::Buy => !matches!(
                    self.positions.portfolio.positions.get(&symbol),
                    Some(p) if p.side == crate::models::position::Side::Long
                ),
                Action::Sell => !self.positions.portfolio.positions.contains_key(&symbol),
                Action::Hold => false,
            };
            if opens_position {
                let planned = Sizing::entry_budget(
                    self.positions.portfolio.cash,
                    self.config.engine.position_size_pct,
                    size_multiplier,
                )
                .unwrap_or(0.0);
                let value = self.positions.portfolio_value(prices);
                if planned <= 0.0
                    || !self.risk.allow_entry(
                        &symbol,
                        planned,
                        &self.positions.portfolio,
                        value,
                    )
                {
                    continue;
                }
            }

            for fill in self
                .positions
                .apply_entry(&symbol, signal, *price, size_multiplier)
            {
                if fill.action.is_close() {
                    self.alerts.on_close(&fill).await;
                }
            }
        }
    }

    fn latest_value(&self) -> f64 {
        let prices: HashMap<String, f64> = self
            .histories
            .iter()
            .filter_map(|(symbol, history)| {
                history.back().map(|price| (symbol.clone(), *price))
            })
            .collect();
        self.positions.portfolio_value(&prices)
    }

    fn persist_snapshot(&self) {
        let snapshot = SessionSnapshot::capture(
            self.config.engine.mode,
            &self.positions.portfolio,
            self.latest_value(),
            self.risk.events(),
            self.risk.kill_switch_active(),
            self.iteration,
        );
        if let Err(e) = self.snapshots.write(&snapshot) {
            error!("snapshot write failed: {e}");
        }
    }
}
