//! End-of-run summary printed to the log.

use statrs::statistics::Statistics;
use tracing::info;

use crate::models::position::Portfolio;
use crate::risk::risk_manager::RiskEvent;

pub struct SessionReport;

impl SessionReport {
    pub fn log(portfolio: &Portfolio, final_value: f64, risk_events: &[RiskEvent], iterations: u64) {
        let pnl = portfolio.pnl(final_value);
        let pnl_pct = portfolio.pnl_pct(final_value);
        let closed: Vec<&_> = portfolio.closed_trades().collect();

        info!("==== SESSION REPORT ====");
        info!(
            initial = portfolio.initial_capital,
            final_value, pnl, pnl_pct, "capital"
        );
        info!(
            total_fills = portfolio.trade_log.len(),
            closed_trades = closed.len(),
            win_rate_pct = portfolio.win_rate() * 100.0,
            fees_paid = portfolio.total_fees_paid,
            "trading"
        );
        info!(
            peak_value = portfolio.peak_value,
            max_drawdown_pct = portfolio.drawdown(final_value) * 100.0,
            sharpe = Self::sharpe_ratio(portfolio),
            risk_events = risk_events.len(),
            iterations,
            "risk"
        );
    }

    /// Per-trade Sharpe ratio over realized percent returns. Zero until at
    /// least two closed trades exist or when returns have no variance.
    pub fn sharpe_ratio(portfolio: &Portfolio) -> f64 {
        let returns: Vec<f64> = portfolio
            .closed_trades()
            .filter_map(|f| f.pnl_pct)
            .collect();
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().mean();
        let std = returns.iter().std_dev();
        if std == 0.0 || !std.is_finite() {
            return 0.0;
        }
        mean / std
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position::{Fill, FillAction, TradeReason};
    use chrono::Utc;
    use uuid::Uuid;

    fn close_fill(pnl_pct: f64) -> Fill {
        Fill {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            symbol: "BTC-USD".to_string(),
            action: FillAction::CloseLong,
            execution_price: 100.0,
            quantity: 1.0,
            gross_value: 100.0,
            fee: 0.1,
            net_value: 99.9,
            pnl: Some(pnl_pct),
            pnl_pct: Some(pnl_pct),
            reason: TradeReason::TakeProfit,
        }
    }

    #[test]
    fn sharpe_needs_two_closed_trades() {
        let mut portfolio = Portfolio::new(1000.0);
        assert_eq!(SessionReport::sharpe_ratio(&portfolio), 0.0);
        portfolio.trade_log.push(close_fill(2.0));
        assert_eq!(SessionReport::sharpe_ratio(&portfolio), 0.0);
        portfolio.trade_log.push(close_fill(1.0));
        assert!(SessionReport::sharpe_ratio(&portfolio) > 0.0);
    }

    #[test]
    fn flat_returns_guard_division() {
        let mut portfolio = Portfolio::new(1000.0);
        portfolio.trade_log.push(close_fill(1.0));
        portfolio.trade_log.push(close_fill(1.0));
        assert_eq!(SessionReport::sharpe_ratio(&portfolio), 0.0);
    }
}
