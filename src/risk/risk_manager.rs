//! Multi-level capital-preservation state machine.
//!
//! One `evaluate` call per tick consumes a portfolio snapshot and the primary
//! symbol's price history, and returns a verdict the scheduler acts on. All
//! state (breaker and freeze timestamps, volatility samples, event log) lives
//! inside the manager; nothing outside mutates it.
//!
//! Escalation ladder on drawdown from peak: WARNING halves new-entry sizing,
//! CRITICAL liquidates and arms a one-hour circuit breaker, EMERGENCY does
//! the same and flags operator attention. Independent of drawdown, a daily
//! loss beyond the limit trips CRITICAL, a portfolio below the global floor
//! forces shutdown, and the black-swan detectors freeze trading for 24 hours.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::models::position::Portfolio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Ok,
    Warning,
    Critical,
    Emergency,
    BlackSwanFreeze,
    CircuitBreaker,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Ok => "OK",
            RiskLevel::Warning => "WARNING",
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::Emergency => "EMERGENCY",
            RiskLevel::BlackSwanFreeze => "BLACK_SWAN_FREEZE",
            RiskLevel::CircuitBreaker => "CIRCUIT_BREAKER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskTrigger {
    Warning,
    Critical,
    Emergency,
    DailyLoss,
    GlobalStop,
    BlackSwan,
    FlashCrash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub timestamp: DateTime<Utc>,
    pub trigger: RiskTrigger,
    /// Drawdown fraction for the drawdown triggers, detector ratio or price
    /// change for the black-swan ones.
    pub drawdown_or_ratio: f64,
    pub portfolio_value: f64,
    pub detail: String,
}

/// What the scheduler must do this tick.
#[derive(Debug, Clone)]
pub struct RiskVerdict {
    pub level: RiskLevel,
    pub allow_entries: bool,
    /// Applied to every new entry's budget (0.5 under WARNING).
    pub size_multiplier: f64,
    /// Force-close every open position at the latest price.
    pub liquidate: bool,
    /// Terminate the control loop after the final snapshot.
    pub shutdown: bool,
}

impl RiskVerdict {
    fn ok() -> Self {
        Self {
            level: RiskLevel::Ok,
            allow_entries: true,
            size_multiplier: 1.0,
            liquidate: false,
            shutdown: false,
        }
    }

    fn blocked(level: RiskLevel) -> Self {
        Self {
            level,
            allow_entries: false,
            size_multiplier: 0.0,
            liquidate: false,
            shutdown: false,
        }
    }
}

/// Immutable view of the portfolio handed to `evaluate` each tick.
#[derive(Debug, Clone, Copy)]
pub struct RiskSnapshot<'a> {
    pub portfolio_value: f64,
    pub peak_value: f64,
    pub initial_capital: f64,
    /// Primary symbol's consensus price history, oldest first.
    pub price_history: &'a [f64],
}

pub struct RiskManager {
    config: RiskConfig,
    level: RiskLevel,
    kill_switch_active: bool,
    circuit_breaker_until: Option<DateTime<Utc>>,
    black_swan_freeze_until: Option<DateTime<Utc>>,
    volatility_samples: VecDeque<f64>,
    events: Vec<RiskEvent>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            level: RiskLevel::Ok,
            kill_switch_active: false,
            circuit_breaker_until: None,
            black_swan_freeze_until: None,
            volatility_samples: VecDeque::with_capacity(64),
            events: Vec::new(),
        }
    }

    pub fn level(&self) -> RiskLevel {
        self.level
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch_active
    }

    pub fn events(&self) -> &[RiskEvent] {
        &self.events
    }

    /// Run the full transition chain for one tick. Never fails: a degenerate
    /// snapshot (zero peak or capital) evaluates to OK with a logged warning.
    pub fn evaluate(&mut self, snapshot: &RiskSnapshot<'_>) -> RiskVerdict {
        let now = Utc::now();

        // Black-swan freeze dominates everything except its own expiry.
        if let Some(until) = self.black_swan_freeze_until {
            if now < until {
                self.level = RiskLevel::BlackSwanFreeze;
                return RiskVerdict::blocked(RiskLevel::BlackSwanFreeze);
            }
            info!("black-swan freeze expired, resuming normal operation");
            self.black_swan_freeze_until = None;
            self.kill_switch_active = false;
            self.level = RiskLevel::Ok;
        }

        if self.detect_black_swan(snapshot.price_history, snapshot.portfolio_value, now) {
            self.level = RiskLevel::BlackSwanFreeze;
            self.kill_switch_active = true;
            let mut verdict = RiskVerdict::blocked(RiskLevel::BlackSwanFreeze);
            verdict.liquidate = true;
            return verdict;
        }

        if let Some(until) = self.circuit_breaker_until {
            if now < until {
                self.level = RiskLevel::CircuitBreaker;
                return RiskVerdict::blocked(RiskLevel::CircuitBreaker);
            }
            info!("circuit breaker expired, kill switch released");
            self.circuit_breaker_until = None;
            self.kill_switch_active = false;
            self.level = RiskLevel::Ok;
        }

        if snapshot.peak_value <= 0.0 || snapshot.initial_capital <= 0.0 {
            warn!("degenerate risk snapshot, defaulting to OK");
            self.level = RiskLevel::Ok;
            return RiskVerdict::ok();
        }

        // Hard floor against slow bleed where the peak never advanced.
        let floor = snapshot.initial_capital * (1.0 - self.config.global_stop_loss_pct);
        if snapshot.portfolio_value <= floor {
            let loss = (snapshot.initial_capital - snapshot.portfolio_value)
                / snapshot.initial_capital;
            error!(
                portfolio_value = snapshot.portfolio_value,
                floor, "GLOBAL STOP LOSS: closing everything and shutting down"
            );
            self.kill_switch_active = true;
            self.level = RiskLevel::Emergency;
            self.push_event(
                RiskTrigger::GlobalStop,
                loss,
                snapshot.portfolio_value,
                format!("value {:.2} at or below floor {floor:.2}", snapshot.portfolio_value),
                now,
            );
            let mut verdict = RiskVerdict::blocked(RiskLevel::Emergency);
            verdict.liquidate = true;
            verdict.shutdown = true;
            return verdict;
        }

        let drawdown = (snapshot.peak_value - snapshot.portfolio_value) / snapshot.peak_value;
        let mut verdict = if drawdown >= self.config.mdd_emergency {
            error!(
                drawdown_pct = drawdown * 100.0,
                "EMERGENCY drawdown: liquidating, circuit breaker armed"
            );
            self.trip_breaker(now);
            self.level = RiskLevel::Emergency;
            self.push_event(
                RiskTrigger::Emergency,
                drawdown,
                snapshot.portfolio_value,
                breaker_detail(self.circuit_breaker_until),
                now,
            );
            let mut v = RiskVerdict::blocked(RiskLevel::Emergency);
            v.liquidate = true;
            v
        } else if drawdown >= self.config.mdd_critical {
            error!(
                drawdown_pct = drawdown * 100.0,
                "CRITICAL drawdown: liquidating, circuit breaker armed"
            );
            self.trip_breaker(now);
            self.level = RiskLevel::Critical;
            self.push_event(
                RiskTrigger::Critical,
                drawdown,
                snapshot.portfolio_value,
                breaker_detail(self.circuit_breaker_until),
                now,
            );
            let mut v = RiskVerdict::blocked(RiskLevel::Critical);
            v.liquidate = true;
            v
        } else if drawdown >= self.config.mdd_warning {
            warn!(
                drawdown_pct = drawdown * 100.0,
                "WARNING drawdown: halving new-entry size"
            );
            // Only the transition into WARNING is an event; staying there is not.
            if self.level != RiskLevel::Warning {
                self.push_event(
                    RiskTrigger::Warning,
                    drawdown,
                    snapshot.portfolio_value,
                    "position size halved for new entries".to_string(),
                    now,
                );
            }
            self.level = RiskLevel::Warning;
            RiskVerdict {
                level: RiskLevel::Warning,
                allow_entries: true,
                size_multiplier: 0.5,
                liquidate: false,
                shutdown: false,
            }
        } else {
            self.level = RiskLevel::Ok;
            RiskVerdict::ok()
        };

        // Daily loss against initial capital escalates anything short of
        // CRITICAL to CRITICAL.
        if !matches!(verdict.level, RiskLevel::Critical | RiskLevel::Emergency) {
            let daily_loss =
                (snapshot.initial_capital - snapshot.portfolio_value) / snapshot.initial_capital;
            if daily_loss >= self.config.daily_loss_limit {
                error!(
                    loss_pct = daily_loss * 100.0,
                    "daily loss limit breached: liquidating, circuit breaker armed"
                );
                self.trip_breaker(now);
                self.level = RiskLevel::Critical;
                self.push_event(
                    RiskTrigger::DailyLoss,
                    daily_loss,
                    snapshot.portfolio_value,
                    breaker_detail(self.circuit_breaker_until),
                    now,
                );
                verdict = RiskVerdict::blocked(RiskLevel::Critical);
                verdict.liquidate = true;
            }
        }

        verdict
    }

    /// Entry gate consulted before any new position. The concentration check
    /// caps a single symbol's exposure as a fraction of portfolio value.
    pub fn allow_entry(
        &self,
        symbol: &str,
        planned_value: f64,
        portfolio: &Portfolio,
        portfolio_value: f64,
    ) -> bool {
        let now = Utc::now();
        if self.kill_switch_active {
            return false;
        }
        if matches!(self.circuit_breaker_until, Some(until) if now < until) {
            return false;
        }
        if matches!(self.black_swan_freeze_until, Some(until) if now < until) {
            return false;
        }
        if portfolio_value <= 0.0 {
            return false;
        }
        let existing = portfolio
            .positions
            .get(symbol)
            .map(|p| p.notional_at_entry())
            .unwrap_or(0.0);
        (existing + planned_value) / portfolio_value <= self.config.max_position_pct
    }

    fn trip_breaker(&mut self, now: DateTime<Utc>) {
        self.kill_switch_active = true;
        self.circuit_breaker_until =
            Some(now + Duration::seconds(self.config.circuit_breaker_cooldown_s as i64));
    }

    /// Volatility-spike and flash-crash detectors. Both need a volatility
    /// baseline of at least `min_vol_samples` observations before they may
    /// fire; every call contributes one sample when the history allows.
    fn detect_black_swan(
        &mut self,
        price_history: &[f64],
        portfolio_value: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let n = price_history.len();

        if n >= 11 {
            let window = &price_history[n - 11..];
            let returns: Vec<f64> = window
                .windows(2)
                .filter(|p| p[0] != 0.0)
                .map(|p| (p[1] - p[0]) / p[0])
                .collect();
            let current_vol = if returns.is_empty() {
                0.0
            } else {
                returns.iter().population_std_dev()
            };

            if self.volatility_samples.len() >= self.config.max_vol_samples {
                self.volatility_samples.pop_front();
            }
            self.volatility_samples.push_back(current_vol);

            if self.volatility_samples.len() >= self.config.min_vol_samples {
                let baseline_window = self
                    .volatility_samples
                    .len()
                    .saturating_sub(self.config.min_vol_samples);
                let baseline: f64 = self
                    .volatility_samples
                    .iter()
                    .skip(baseline_window)
                    .mean();
                if baseline > 0.0 && current_vol > self.config.vol_spike_ratio * baseline {
                    let ratio = current_vol / baseline;
                    self.freeze(now);
                    error!(
                        ratio,
                        "BLACK SWAN: volatility spike, trading frozen for 24h"
                    );
                    self.push_event(
                        RiskTrigger::BlackSwan,
                        ratio,
                        portfolio_value,
                        freeze_detail(self.black_swan_freeze_until),
                        now,
                    );
                    return true;
                }
            }
        }

        if n >= self.config.flash_crash_window
            && self.volatility_samples.len() >= self.config.min_vol_samples
        {
            let base = price_history[n - self.config.flash_crash_window];
            if base > 0.0 {
                let change = (price_history[n - 1] - base) / base;
                if change < self.config.flash_crash_threshold {
                    self.freeze(now);
                    error!(
                        change_pct = change * 100.0,
                        "BLACK SWAN: flash crash, trading frozen for 24h"
                    );
                    self.push_event(
                        RiskTrigger::FlashCrash,
                        change,
                        portfolio_value,
                        freeze_detail(self.black_swan_freeze_until),
                        now,
                    );
                    return true;
                }
            }
        }

        false
    }

    fn freeze(&mut self, now: DateTime<Utc>) {
        self.kill_switch_active = true;
        self.black_swan_freeze_until =
            Some(now + Duration::seconds(self.config.black_swan_freeze_s as i64));
    }

    fn push_event(
        &mut self,
        trigger: RiskTrigger,
        ratio: f64,
        portfolio_value: f64,
        detail: String,
        now: DateTime<Utc>,
    ) {
        self.events.push(RiskEvent {
            timestamp: now,
            trigger,
            drawdown_or_ratio: ratio,
            portfolio_value,
            detail,
        });
    }
}

fn breaker_detail(until: Option<DateTime<Utc>>) -> String {
    match until {
        Some(t) => format!("circuit breaker until {t}"),
        None => "circuit breaker".to_string(),
    }
}

fn freeze_detail(until: Option<DateTime<Utc>>) -> String {
    match until {
        Some(t) => format!("frozen until {t}"),
        None => "frozen".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default())
    }

    fn snapshot(value: f64, peak: f64, history: &[f64]) -> RiskSnapshot<'_> {
        RiskSnapshot {
            portfolio_value: value,
            peak_value: peak,
            initial_capital: 1000.0,
            price_history: history,
        }
    }

    #[test]
    fn healthy_portfolio_is_ok() {
        let mut mgr = manager();
        let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &[100.0, 101.0]));
        assert_eq!(verdict.level, RiskLevel::Ok);
        assert!(verdict.allow_entries);
        assert_eq!(verdict.size_multiplier, 1.0);
    }

    #[test]
    fn warning_at_exactly_three_percent() {
        let mut mgr = manager();
        let verdict = mgr.evaluate(&snapshot(970.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Warning);
        assert!(verdict.allow_entries);
        assert_eq!(verdict.size_multiplier, 0.5);
        assert!(!verdict.liquidate);
        assert!(!mgr.kill_switch_active());
        // A hair less does not cross the boundary.
        let mut fresh = manager();
        let verdict = fresh.evaluate(&snapshot(970.01, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Ok);
    }

    #[test]
    fn critical_at_exactly_five_percent_arms_breaker() {
        let mut mgr = manager();
        let before = Utc::now();
        let verdict = mgr.evaluate(&snapshot(950.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Critical);
        assert!(verdict.liquidate);
        assert!(!verdict.allow_entries);
        assert!(mgr.kill_switch_active());
        let until = mgr.circuit_breaker_until.expect("breaker armed");
        let cooldown = (until - before).num_seconds();
        assert!((3595..=3605).contains(&cooldown));
        assert_eq!(mgr.events().last().unwrap().trigger, RiskTrigger::Critical);
    }

    #[test]
    fn emergency_at_exactly_eight_percent() {
        let mut mgr = manager();
        let verdict = mgr.evaluate(&snapshot(920.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Emergency);
        assert!(verdict.liquidate);
        assert_eq!(mgr.events().last().unwrap().trigger, RiskTrigger::Emergency);
    }

    #[test]
    fn breaker_blocks_until_expiry_then_releases() {
        let mut mgr = manager();
        mgr.kill_switch_active = true;
        mgr.circuit_breaker_until = Some(Utc::now() + Duration::seconds(60));
        let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::CircuitBreaker);
        assert!(!verdict.allow_entries);

        mgr.circuit_breaker_until = Some(Utc::now() - Duration::seconds(1));
        let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Ok);
        assert!(!mgr.kill_switch_active());
        assert!(mgr.circuit_breaker_until.is_none());
    }

    #[test]
    fn daily_loss_trips_critical_even_without_drawdown_from_peak() {
        let mut mgr = manager();
        // Peak has been reset by earlier gains, drawdown from peak is tiny,
        // but we are down 9% against initial capital.
        let verdict = mgr.evaluate(&snapshot(910.0, 928.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Critical);
        assert!(verdict.liquidate);
        assert_eq!(mgr.events().last().unwrap().trigger, RiskTrigger::DailyLoss);
    }

    #[test]
    fn global_floor_forces_shutdown() {
        let mut mgr = manager();
        let verdict = mgr.evaluate(&snapshot(799.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Emergency);
        assert!(verdict.shutdown);
        assert!(verdict.liquidate);
        assert_eq!(mgr.events().last().unwrap().trigger, RiskTrigger::GlobalStop);
    }

    #[test]
    fn freeze_blocks_and_auto_releases() {
        let mut mgr = manager();
        mgr.kill_switch_active = true;
        mgr.black_swan_freeze_until = Some(Utc::now() + Duration::hours(1));
        let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::BlackSwanFreeze);

        mgr.black_swan_freeze_until = Some(Utc::now() - Duration::seconds(1));
        let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &[]));
        assert_eq!(verdict.level, RiskLevel::Ok);
        assert!(!mgr.kill_switch_active());
        assert!(mgr.black_swan_freeze_until.is_none());
    }

    #[test]
    fn flash_crash_freezes_for_24_hours() {
        let mut mgr = manager();
        // Stable regime builds the volatility baseline, then a 17% slide
        // over the last 60 observations.
        let mut history: Vec<f64> = vec![90_000.0; 70];
        for i in 0..60 {
            let progress = (i + 1) as f64 / 60.0;
            history.push(90_000.0 * (1.0 - 0.17 * progress));
        }
        let before = Utc::now();
        let mut fired = false;
        for end in 12..=history.len() {
            let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &history[..end]));
            if verdict.level == RiskLevel::BlackSwanFreeze {
                fired = true;
                break;
            }
        }
        assert!(fired, "flash crash went undetected");
        let until = mgr.black_swan_freeze_until.expect("freeze armed");
        let duration = (until - before).num_seconds();
        assert!((86_395..=86_405).contains(&duration));
        let event = mgr.events().last().unwrap();
        assert_eq!(event.trigger, RiskTrigger::FlashCrash);
        assert!(event.drawdown_or_ratio < -0.15);
    }

    #[test]
    fn stable_market_never_triggers_detectors() {
        let mut mgr = manager();
        let mut history: Vec<f64> = Vec::new();
        for i in 0..120 {
            history.push(90_000.0 * (1.0 + 0.002 * (i as f64 * 0.5).sin()));
            let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &history));
            assert_ne!(verdict.level, RiskLevel::BlackSwanFreeze);
        }
        assert!(mgr.black_swan_freeze_until.is_none());
    }

    #[test]
    fn volatility_spike_triggers_black_swan() {
        let mut mgr = manager();
        // Long quiet baseline.
        let mut history: Vec<f64> = Vec::new();
        for i in 0..60 {
            history.push(90_000.0 * (1.0 + 0.001 * (i as f64 * 0.5).sin()));
            mgr.evaluate(&snapshot(995.0, 1000.0, &history));
        }
        assert!(mgr.volatility_samples.len() >= 30);
        // Violent alternation: +/-25% swings.
        let mut price = *history.last().unwrap();
        let mut fired = false;
        for i in 0..12 {
            price *= if i % 2 == 0 { 1.25 } else { 0.75 };
            history.push(price);
            let verdict = mgr.evaluate(&snapshot(995.0, 1000.0, &history));
            if verdict.level == RiskLevel::BlackSwanFreeze {
                fired = true;
                break;
            }
        }
        assert!(fired, "volatility spike went undetected");
        assert_eq!(mgr.events().last().unwrap().trigger, RiskTrigger::BlackSwan);
    }

    #[test]
    fn entry_gate_respects_kill_switch_and_concentration() {
        let mut mgr = manager();
        let portfolio = Portfolio::new(1000.0);
        assert!(mgr.allow_entry("BTC-USD", 100.0, &portfolio, 1000.0));

        // Concentration: 250 planned on a 1000 portfolio exceeds 20%.
        assert!(!mgr.allow_entry("BTC-USD", 250.0, &portfolio, 1000.0));

        mgr.kill_switch_active = true;
        assert!(!mgr.allow_entry("BTC-USD", 100.0, &portfolio, 1000.0));
    }

    #[test]
    fn degenerate_snapshot_defaults_to_ok() {
        let mut mgr = manager();
        let verdict = mgr.evaluate(&RiskSnapshot {
            portfolio_value: 0.0,
            peak_value: 0.0,
            initial_capital: 0.0,
            price_history: &[],
        });
        assert_eq!(verdict.level, RiskLevel::Ok);
        assert!(mgr.events().is_empty());
    }
}
