//! Session snapshot persistence.
//!
//! One JSON file per snapshot, named by wall-clock time. Files are written
//! to a temp path and renamed into place so a concurrent reader never sees
//! a partially written snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Mode;
use crate::models::position::{Fill, Portfolio, Side};
use crate::risk::risk_manager::RiskEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub timestamp: DateTime<Utc>,
    pub mode: Mode,
    pub initial_capital: f64,
    pub cash: f64,
    pub positions: HashMap<String, PositionSnapshot>,
    pub portfolio_value: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub peak_value: f64,
    pub max_drawdown: f64,
    pub total_fees_paid: f64,
    pub total_trades: usize,
    pub trade_log: Vec<Fill>,
    pub risk_events: Vec<RiskEvent>,
    pub kill_switch_active: bool,
    pub iteration: u64,
}

impl SessionSnapshot {
    pub fn capture(
        mode: Mode,
        portfolio: &Portfolio,
        portfolio_value: f64,
        risk_events: &[RiskEvent],
        kill_switch_active: bool,
        iteration: u64,
    ) -> Self {
        let positions = portfolio
            .positions
            .iter()
            .map(|(symbol, pos)| {
                (
                    symbol.clone(),
                    PositionSnapshot {
                        side: pos.side,
                        quantity: pos.quantity,
                        entry_price: pos.entry_price,
                        entry_time: pos.entry_time,
                        stop_loss: pos.stop_loss,
                        take_profit: pos.take_profit,
                    },
                )
            })
            .collect();
        Self {
            timestamp: Utc::now(),
            mode,
            initial_capital: portfolio.initial_capital,
            cash: portfolio.cash,
            positions,
            portfolio_value,
            pnl: portfolio.pnl(portfolio_value),
            pnl_pct: portfolio.pnl_pct(portfolio_value),
            peak_value: portfolio.peak_value,
            max_drawdown: portfolio.drawdown(portfolio_value),
            total_fees_paid: portfolio.total_fees_paid,
            total_trades: portfolio.trade_log.len(),
            trade_log: portfolio.trade_log.clone(),
            risk_events: risk_events.to_vec(),
            kill_switch_active,
            iteration,
        }
    }
}

pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Write-then-rename so readers only ever observe complete files.
    pub fn write(&self, snapshot: &SessionSnapshot) -> anyhow::Result<PathBuf> {
        let name = format!(
            "session_{}.json",
            snapshot.timestamp.format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        let body = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;

        info!(path = %path.display(), "session snapshot saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position::Position;

    fn sample_portfolio() -> Portfolio {
        let mut portfolio = Portfolio::new(1000.0);
        portfolio.cash = 899.9;
        portfolio.total_fees_paid = 0.1;
        portfolio.positions.insert(
            "BTC-USD".to_string(),
            Position {
                symbol: "BTC-USD".to_string(),
                side: Side::Long,
                quantity: 0.001,
                entry_price: 100_050.0,
                entry_time: Utc::now(),
                stop_loss: 98_049.0,
                take_profit: 103_051.5,
                atr_at_entry: 120.0,
            },
        );
        portfolio
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let portfolio = sample_portfolio();
        let snapshot =
            SessionSnapshot::capture(Mode::Paper, &portfolio, 999.95, &[], false, 42);

        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());
        let path = writer.write(&snapshot).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: SessionSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.iteration, 42);
        assert_eq!(parsed.mode, Mode::Paper);
        assert!(parsed.positions.contains_key("BTC-USD"));
        assert!((parsed.cash - 899.9).abs() < 1e-9);
        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn snapshot_carries_pnl_and_drawdown() {
        let mut portfolio = sample_portfolio();
        portfolio.peak_value = 1050.0;
        let snapshot =
            SessionSnapshot::capture(Mode::Paper, &portfolio, 980.0, &[], true, 7);
        assert!((snapshot.pnl + 20.0).abs() < 1e-9);
        assert!((snapshot.pnl_pct + 2.0).abs() < 1e-9);
        assert!((snapshot.max_drawdown - 70.0 / 1050.0).abs() < 1e-12);
        assert!(snapshot.kill_switch_active);
    }
}
