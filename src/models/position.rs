use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => f.write_str("LONG"),
            Side::Short => f.write_str("SHORT"),
        }
    }
}

/// One open position per symbol. Created by an entry fill, mutated only by
/// trailing-stop updates, removed atomically on any exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub atr_at_entry: f64,
}

impl Position {
    /// Unrealized profit relative to entry, in percent, sign-adjusted for side.
    pub fn profit_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Long => (price - self.entry_price) / self.entry_price * 100.0,
            Side::Short => (self.entry_price - price) / self.entry_price * 100.0,
        }
    }

    pub fn notional_at_entry(&self) -> f64 {
        self.quantity * self.entry_price
    }

    /// Contribution to portfolio value at the given price.
    /// Shorts carry only their mark-to-market P&L since entry.
    pub fn market_value(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => self.quantity * price,
            Side::Short => self.quantity * (self.entry_price - price),
        }
    }

    pub fn stop_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    pub fn target_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price >= self.take_profit,
            Side::Short => price <= self.take_profit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillAction {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
}

impl FillAction {
    pub fn is_close(&self) -> bool {
        matches!(self, FillAction::CloseLong | FillAction::CloseShort)
    }
}

/// Why a fill happened. Entries always carry `Signal`; closes carry the exit
/// rule that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeReason {
    Signal,
    StopLoss,
    TakeProfit,
    MacdExit,
    IndicatorExit,
    SecureProfit,
    KillSwitch,
}

impl std::fmt::Display for TradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeReason::Signal => "SIGNAL",
            TradeReason::StopLoss => "STOP_LOSS",
            TradeReason::TakeProfit => "TAKE_PROFIT",
            TradeReason::MacdExit => "MACD_EXIT",
            TradeReason::IndicatorExit => "INDICATOR_EXIT",
            TradeReason::SecureProfit => "SECURE_PROFIT",
            TradeReason::KillSwitch => "KILL_SWITCH",
        };
        f.write_str(s)
    }
}

/// Record of an executed (or simulated) fill.
///
/// `net_value` is proceeds for closing longs and total cost for everything
/// else. `pnl`/`pnl_pct` are set on closes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: FillAction,
    pub execution_price: f64,
    pub quantity: f64,
    pub gross_value: f64,
    pub fee: f64,
    pub net_value: f64,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub reason: TradeReason,
}

/// The trading book: cash plus keyed positions plus the running fill log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: f64,
    pub initial_capital: f64,
    pub positions: HashMap<String, Position>,
    pub peak_value: f64,
    pub total_fees_paid: f64,
    pub trade_log: Vec<Fill>,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            positions: HashMap::new(),
            peak_value: initial_capital,
            total_fees_paid: 0.0,
            trade_log: Vec::new(),
        }
    }

    /// Mark-to-market value: cash + long holdings + short P&L.
    /// A symbol with no quoted price falls back to its entry price.
    pub fn value(&self, prices: &HashMap<String, f64>) -> f64 {
        let mut total = self.cash;
        for (symbol, pos) in &self.positions {
            let price = prices.get(symbol).copied().unwrap_or(pos.entry_price);
            total += pos.market_value(price);
        }
        total
    }

    pub fn drawdown(&self, current_value: f64) -> f64 {
        if self.peak_value <= 0.0 {
            return 0.0;
        }
        ((self.peak_value - current_value) / self.peak_value).max(0.0)
    }

    pub fn pnl(&self, current_value: f64) -> f64 {
        current_value - self.initial_capital
    }

    pub fn pnl_pct(&self, current_value: f64) -> f64 {
        if self.initial_capital <= 0.0 {
            return 0.0;
        }
        self.pnl(current_value) / self.initial_capital * 100.0
    }

    pub fn closed_trades(&self) -> impl Iterator<Item = &Fill> {
        self.trade_log.iter().filter(|f| f.action.is_close())
    }

    pub fn win_rate(&self) -> f64 {
        let mut closed = 0usize;
        let mut won = 0usize;
        for fill in self.closed_trades() {
            closed += 1;
            if fill.pnl.unwrap_or(0.0) > 0.0 {
                won += 1;
            }
        }
        if closed == 0 {
            return 0.0;
        }
        won as f64 / closed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(symbol: &str, qty: f64, entry: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            quantity: qty,
            entry_price: entry,
            entry_time: Utc::now(),
            stop_loss: entry * 0.98,
            take_profit: entry * 1.03,
            atr_at_entry: 0.0,
        }
    }

    #[test]
    fn short_value_is_entry_relative() {
        let pos = Position {
            side: Side::Short,
            ..long("BTC-USD", 0.5, 90_000.0)
        };
        // Price fell 1000: short is up 500.
        assert!((pos.market_value(89_000.0) - 500.0).abs() < 1e-9);
        // Price rose 1000: short is down 500.
        assert!((pos.market_value(91_000.0) + 500.0).abs() < 1e-9);
    }

    #[test]
    fn profit_pct_sign_follows_side() {
        let l = long("ETH-USD", 1.0, 100.0);
        assert!((l.profit_pct(102.0) - 2.0).abs() < 1e-9);
        let s = Position {
            side: Side::Short,
            ..long("ETH-USD", 1.0, 100.0)
        };
        assert!((s.profit_pct(98.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn portfolio_value_falls_back_to_entry_price() {
        let mut p = Portfolio::new(1000.0);
        p.positions
            .insert("SOL-USD".into(), long("SOL-USD", 2.0, 150.0));
        let value = p.value(&HashMap::new());
        assert!((value - 1300.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_is_non_negative() {
        let mut p = Portfolio::new(1000.0);
        p.peak_value = 1000.0;
        assert!((p.drawdown(950.0) - 0.05).abs() < 1e-12);
        assert_eq!(p.drawdown(1100.0), 0.0);
    }
}
