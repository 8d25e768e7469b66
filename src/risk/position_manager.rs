//! Position lifecycle: entries with fees and slippage, the exit-policy chain,
//! and portfolio valuation.
//!
//! Owned by the scheduler and mutated only on its thread. Shorts follow the
//! simple collateral model: sale proceeds are not credited at open, the open
//! fee is debited immediately, and P&L lands in cash at close.

use chrono::Utc;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::models::position::{Fill, FillAction, Portfolio, Position, Side, TradeReason};
use crate::models::signal::{Action, Signal};
use crate::risk::sizing::Sizing;

pub struct PositionManager {
    pub portfolio: Portfolio,
    config: EngineConfig,
}

impl PositionManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            portfolio: Portfolio::new(config.initial_capital),
            config,
        }
    }

    pub fn portfolio_value(&self, prices: &HashMap<String, f64>) -> f64 {
        self.portfolio.value(prices)
    }

    /// Peak is ratcheted at the end of every tick regardless of risk state.
    pub fn update_peak(&mut self, portfolio_value: f64) {
        if portfolio_value > self.portfolio.peak_value {
            self.portfolio.peak_value = portfolio_value;
        }
    }

    /// Act on an entry-worthy signal for a symbol with the risk-scaled size
    /// multiplier. BUY closes an existing short before considering a long;
    /// SELL closes an existing long, or opens a short when allowed and the
    /// signal is strong enough. Returns the fills executed this call.
    pub fn apply_entry(
        &mut self,
        symbol: &str,
        signal: &Signal,
        price: f64,
        size_multiplier: f64,
    ) -> Vec<Fill> {
        let mut fills = Vec::new();
        match signal.action {
            Action::Buy => {
                if let Some(pos) = self.portfolio.positions.get(symbol) {
                    if pos.side == Side::Short {
                        if let Some(fill) = self.close(symbol, price, TradeReason::Signal) {
                            fills.push(fill);
                        }
                    } else {
                        return fills; // already long
                    }
                }
                if self.portfolio.positions.len() >= self.config.max_positions {
                    return fills;
                }
                if let Some(fill) =
                    self.open_long(symbol, price, signal.indicators.atr, size_multiplier)
                {
                    fills.push(fill);
                }
            }
            Action::Sell => {
                if let Some(pos) = self.portfolio.positions.get(symbol) {
                    if pos.side == Side::Long {
                        if let Some(fill) = self.close(symbol, price, TradeReason::Signal) {
                            fills.push(fill);
                        }
                    }
                    return fills; // existing short stays as-is
                }
                if self.config.allow_short
                    && signal.confidence >= self.config.short_min_confidence
                    && self.portfolio.positions.len() < self.config.max_positions
                {
                    if let Some(fill) =
                        self.open_short(symbol, price, signal.indicators.atr, size_multiplier)
                    {
                        fills.push(fill);
                    }
                }
            }
            Action::Hold => {}
        }
        fills
    }

    /// Open a LONG at the slippage-adjusted price. The initial stop is the
    /// tighter of the fixed percent stop and entry minus two ATRs.
    pub fn open_long(
        &mut self,
        symbol: &str,
        price: f64,
        atr: f64,
        size_multiplier: f64,
    ) -> Option<Fill> {
        if price <= 0.0 || self.portfolio.positions.contains_key(symbol) {
            return None;
        }
        let value = Sizing::entry_budget(
            self.portfolio.cash,
            self.config.position_size_pct,
            size_multiplier,
        )?;
        let execution_price = price * (1.0 + self.config.slippage_pct);
        let fee = value * self.config.fee_pct;
        if self.portfolio.cash < value + fee {
            return None;
        }
        let quantity = value / execution_price;

        let stop_loss = if atr > 0.0 {
            (execution_price * (1.0 - self.config.stop_loss_pct)).max(execution_price - 2.0 * atr)
        } else {
            execution_price * (1.0 - self.config.stop_loss_pct)
        };
        let take_profit = execution_price * (1.0 + self.config.take_profit_pct);

        self.portfolio.cash -= value + fee;
        self.portfolio.total_fees_paid += fee;
        self.portfolio.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side: Side::Long,
                quantity,
                entry_price: execution_price,
                entry_time: Utc::now(),
                stop_loss,
                take_profit,
                atr_at_entry: atr,
            },
        );

        info!(
            symbol,
            quantity,
            execution_price,
            value,
            fee,
            "opened LONG"
        );
        Some(self.record_fill(
            symbol,
            FillAction::OpenLong,
            execution_price,
            quantity,
            value,
            fee,
            value + fee,
            None,
            None,
            TradeReason::Signal,
        ))
    }

    /// Open a SHORT at the slippage-adjusted price. Proceeds are not credited
    /// at open; only the fee moves cash now.
    pub fn open_short(
        &mut self,
        symbol: &str,
        price: f64,
        atr: f64,
        size_multiplier: f64,
    ) -> Option<Fill> {
        if price <= 0.0 || self.portfolio.positions.contains_key(symbol) {
            return None;
        }
        let value = Sizing::entry_budget(
            self.portfolio.cash,
            self.config.position_size_pct,
            size_multiplier,
        )?;
        let execution_price = price * (1.0 - self.config.slippage_pct);
        let fee = value * self.config.fee_pct;
        if self.portfolio.cash < fee {
            return None;
        }
        let quantity = value / execution_price;

        let stop_loss = if atr > 0.0 {
            (execution_price * (1.0 + self.config.stop_loss_pct)).min(execution_price + 2.0 * atr)
        } else {
            execution_price * (1.0 + self.config.stop_loss_pct)
        };
        let take_profit = execution_price * (1.0 - self.config.take_profit_pct);

        self.portfolio.cash -= fee;
        self.portfolio.total_fees_paid += fee;
        self.portfolio.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side: Side::Short,
                quantity,
                entry_price: execution_price,
                entry_time: Utc::now(),
                stop_loss,
                take_profit,
                atr_at_entry: atr,
            },
        );

        info!(
            symbol,
            quantity,
            execution_price,
            collateral = value,
            fee,
            "opened SHORT"
        );
        Some(self.record_fill(
            symbol,
            FillAction::OpenShort,
            execution_price,
            quantity,
            value,
            fee,
            fee,
            None,
            None,
            TradeReason::Signal,
        ))
    }

    /// Close whatever position is open on the symbol. Returns `None` when
    /// there is nothing to close.
    pub fn close(&mut self, symbol: &str, price: f64, reason: TradeReason) -> Option<Fill> {
        let pos = self.portfolio.positions.remove(symbol)?;
        let fill = match pos.side {
            Side::Long => {
                let execution_price = price * (1.0 - self.config.slippage_pct);
                let proceeds = pos.quantity * execution_price;
                let fee = proceeds * self.config.fee_pct;
                let net = proceeds - fee;
                let cost_basis = pos.quantity * pos.entry_price;
                let pnl = net - cost_basis;
                let pnl_pct = if cost_basis > 0.0 {
                    pnl / cost_basis * 100.0
                } else {
                    0.0
                };
                self.portfolio.cash += net;
                self.portfolio.total_fees_paid += fee;
                info!(symbol, pnl, pnl_pct, %reason, "closed LONG");
                self.record_fill(
                    symbol,
                    FillAction::CloseLong,
                    execution_price,
                    pos.quantity,
                    proceeds,
                    fee,
                    net,
                    Some(pnl),
                    Some(pnl_pct),
                    reason,
                )
            }
            Side::Short => {
                let execution_price = price * (1.0 + self.config.slippage_pct);
                let cost = pos.quantity * execution_price;
                let fee = cost * self.config.fee_pct;
                let sold = pos.quantity * pos.entry_price;
                let pnl = sold - (cost + fee);
                let pnl_pct = if sold > 0.0 { pnl / sold * 100.0 } else { 0.0 };
                self.portfolio.cash += pnl;
                self.portfolio.total_fees_paid += fee;
                info!(symbol, pnl, pnl_pct, %reason, "closed SHORT");
                self.record_fill(
                    symbol,
                    FillAction::CloseShort,
                    execution_price,
                    pos.quantity,
                    cost,
                    fee,
                    cost + fee,
                    Some(pnl),
                    Some(pnl_pct),
                    reason,
                )
            }
        };
        Some(fill)
    }

    /// Run the exit-policy chain for one open position, in priority order:
    /// stop loss, take profit, MACD crossover (in profit), strong inverse
    /// signal, secure-profit exit, trailing stop to break-even.
    pub fn evaluate_exits(&mut self, symbol: &str, price: f64, signal: &Signal) -> Option<Fill> {
        let pos = self.portfolio.positions.get(symbol)?;
        let side = pos.side;
        let entry_price = pos.entry_price;
        let profit_pct = pos.profit_pct(price);

        if pos.stop_hit(price) {
            info!(symbol, %side, profit_pct, "stop loss hit");
            return self.close(symbol, price, TradeReason::StopLoss);
        }
        if pos.target_hit(price) {
            info!(symbol, %side, profit_pct, "take profit hit");
            return self.close(symbol, price, TradeReason::TakeProfit);
        }

        if profit_pct >= 1.0 {
            let ind = &signal.indicators;
            let macd_cross = match side {
                Side::Long => ind.macd_line < ind.macd_signal,
                Side::Short => ind.macd_line > ind.macd_signal,
            };
            if macd_cross {
                info!(symbol, %side, profit_pct, "MACD crossover exit");
                return self.close(symbol, price, TradeReason::MacdExit);
            }

            if signal.opposes(side) {
                if signal.confidence >= 50.0 {
                    info!(
                        symbol,
                        %side,
                        confidence = signal.confidence,
                        profit_pct,
                        "strong inverse signal exit"
                    );
                    return self.close(symbol, price, TradeReason::IndicatorExit);
                }
                if profit_pct >= 2.0 && signal.confidence >= 35.0 {
                    info!(
                        symbol,
                        %side,
                        confidence = signal.confidence,
                        profit_pct,
                        "securing profit on moderate inverse signal"
                    );
                    return self.close(symbol, price, TradeReason::SecureProfit);
                }
            }
        }

        // Trailing stop: once 1.5% in profit, pull the stop to break-even
        // plus a 0.5% buffer. Stops only ever tighten.
        if profit_pct >= 1.5 {
            let pos = self.portfolio.positions.get_mut(symbol)?;
            match side {
                Side::Long => {
                    let new_stop = entry_price * 1.005;
                    if new_stop > pos.stop_loss {
                        info!(symbol, new_stop, "trailing stop raised to break-even");
                        pos.stop_loss = new_stop;
                    }
                }
                Side::Short => {
                    let new_stop = entry_price * 0.995;
                    if new_stop < pos.stop_loss {
                        info!(symbol, new_stop, "trailing stop lowered to break-even");
                        pos.stop_loss = new_stop;
                    }
                }
            }
        }

        None
    }

    /// Force-close every open position at the latest known prices.
    pub fn liquidate_all(
        &mut self,
        prices: &HashMap<String, f64>,
        reason: TradeReason,
    ) -> Vec<Fill> {
        let symbols: Vec<String> = self.portfolio.positions.keys().cloned().collect();
        let mut fills = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let price = prices
                .get(&symbol)
                .copied()
                .or_else(|| {
                    self.portfolio
                        .positions
                        .get(&symbol)
                        .map(|p| p.entry_price)
                })
                .unwrap_or(0.0);
            if price <= 0.0 {
                continue;
            }
            if let Some(fill) = self.close(&symbol, price, reason) {
                fills.push(fill);
            }
        }
        fills
    }

    /// Internal consistency check run once per tick. A violation is fatal:
    /// the scheduler snapshots and halts.
    pub fn assert_invariants(&self) -> anyhow::Result<()> {
        for (symbol, pos) in &self.portfolio.positions {
            anyhow::ensure!(
                pos.quantity > 0.0 && pos.quantity.is_finite(),
                "invariant violated: non-positive quantity for {symbol}"
            );
            anyhow::ensure!(
                pos.entry_price > 0.0 && pos.entry_price.is_finite(),
                "invariant violated: non-positive entry price for {symbol}"
            );
        }
        anyhow::ensure!(
            self.portfolio.cash.is_finite(),
            "invariant violated: cash is not finite"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_fill(
        &mut self,
        symbol: &str,
        action: FillAction,
        execution_price: f64,
        quantity: f64,
        gross_value: f64,
        fee: f64,
        net_value: f64,
        pnl: Option<f64>,
        pnl_pct: Option<f64>,
        reason: TradeReason,
    ) -> Fill {
        let fill = Fill {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            action,
            execution_price,
            quantity,
            gross_value,
            fee,
            net_value,
            pnl,
            pnl_pct,
            reason,
        };
        self.portfolio.trade_log.push(fill.clone());
        fill
    }
}
