//! Vote-based signal synthesis with an EMA-200 trend gate.
//!
//! Each indicator contributes a signed vote; votes that would fight the
//! prevailing trend are vetoed. Long entries need a BULLISH regime, short
//! entries a BEARISH one.

use std::sync::Arc;

use crate::models::signal::{Action, Signal, Trend};
use crate::signals::advisor::{state_vector, Advisor};
use crate::signals::indicators::IndicatorSet;

/// Minimum history before any non-HOLD signal is produced.
pub const MIN_SAMPLES: usize = 15;

const BUY_THRESHOLD: f64 = 0.3;
const SELL_THRESHOLD: f64 = -0.3;

pub struct SignalGenerator {
    advisor: Option<Arc<dyn Advisor>>,
    advisor_weight: f64,
}

impl Default for SignalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalGenerator {
    pub fn new() -> Self {
        Self {
            advisor: None,
            advisor_weight: 0.0,
        }
    }

    /// Attach an RL advisor as one extra weighted voter. Off by default.
    pub fn with_advisor(advisor: Arc<dyn Advisor>, weight: f64) -> Self {
        Self {
            advisor: Some(advisor),
            advisor_weight: weight,
        }
    }

    pub fn evaluate(&self, closes: &[f64]) -> Signal {
        if closes.len() < MIN_SAMPLES {
            let price = closes.last().copied().unwrap_or(0.0);
            return Signal::hold(
                IndicatorSet::neutral(price),
                format!("Gathering data ({}/{MIN_SAMPLES})", closes.len()),
            );
        }

        let price = closes[closes.len() - 1];
        let ind = IndicatorSet::compute(closes);

        let mut votes: Vec<f64> = Vec::with_capacity(6);
        let mut reasons: Vec<String> = Vec::new();

        // RSI extremes. A trend-vetoed extreme contributes no vote at all;
        // a mid-range RSI contributes an explicit zero.
        if ind.rsi < 30.0 {
            if ind.trend == Trend::Bullish {
                let weight = if ind.rsi < 25.0 { 2 } else { 1 };
                for _ in 0..weight {
                    votes.push(1.0);
                }
                reasons.push(format!("RSI oversold ({:.1})", ind.rsi));
            }
        } else if ind.rsi > 70.0 {
            if ind.trend == Trend::Bearish {
                let weight = if ind.rsi > 75.0 { 2 } else { 1 };
                for _ in 0..weight {
                    votes.push(-1.0);
                }
                reasons.push(format!("RSI overbought ({:.1})", ind.rsi));
            }
        } else {
            votes.push(0.0);
        }

        // MACD agreement with the trend.
        if ind.macd_histogram > 0.0 && ind.macd_line > ind.macd_signal && ind.trend == Trend::Bullish
        {
            votes.push(1.0);
            reasons.push("MACD bullish".to_string());
        } else if ind.macd_histogram < 0.0
            && ind.macd_line < ind.macd_signal
            && ind.trend == Trend::Bearish
        {
            votes.push(-1.0);
            reasons.push("MACD bearish".to_string());
        } else {
            votes.push(0.0);
        }

        // Bollinger band touches, trend-gated.
        if price < ind.bb_lower && ind.trend == Trend::Bullish {
            votes.push(1.0);
            reasons.push("Price below lower band".to_string());
        } else if price > ind.bb_upper && ind.trend == Trend::Bearish {
            votes.push(-1.0);
            reasons.push("Price above upper band".to_string());
        } else {
            votes.push(0.0);
        }

        // Momentum beyond +/-2%.
        if ind.momentum_pct > 2.0 {
            votes.push(1.0);
            reasons.push(format!("Strong momentum (+{:.1}%)", ind.momentum_pct));
        } else if ind.momentum_pct < -2.0 {
            votes.push(-1.0);
            reasons.push(format!("Negative momentum ({:.1}%)", ind.momentum_pct));
        } else {
            votes.push(0.0);
        }

        if ind.volatility_pct > 3.0 {
            reasons.push(format!("High volatility ({:.1}%)", ind.volatility_pct));
        }

        if let Some(advisor) = &self.advisor {
            let state = state_vector(&ind, price);
            let (action, _log_prob) = advisor.select_action(&state, 0.0);
            let vote = match action {
                Action::Buy => self.advisor_weight,
                Action::Sell => -self.advisor_weight,
                Action::Hold => 0.0,
            };
            votes.push(vote);
        }

        let mean = votes.iter().sum::<f64>() / votes.len() as f64;
        let confidence = mean.abs() * 100.0;
        let action = if mean > BUY_THRESHOLD {
            Action::Buy
        } else if mean < SELL_THRESHOLD {
            Action::Sell
        } else {
            Action::Hold
        };

        if reasons.is_empty() {
            reasons.push("Neutral market".to_string());
        }

        Signal {
            action,
            confidence,
            reasons,
            indicators: ind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A long BULLISH base (well above its EMA anchor) ending in a sharp
    /// oversold dip below the lower band.
    fn bullish_oversold_series() -> Vec<f64> {
        let mut closes: Vec<f64> = Vec::new();
        for i in 0..110 {
            closes.push(100.0 + i as f64);
        }
        let top = *closes.last().unwrap();
        for _ in 0..10 {
            closes.push(top);
        }
        // Sharp pullback: deep enough to crater RSI and pierce the band,
        // shallow enough to keep the price >2% above the long EMA.
        for i in 1..=10 {
            closes.push(top - 3.0 * i as f64);
        }
        closes
    }

    #[test]
    fn short_history_always_holds() {
        let gen = SignalGenerator::new();
        let closes = vec![100.0; 14];
        let signal = gen.evaluate(&closes);
        assert_eq!(signal.action, Action::Hold);
        assert_eq!(signal.confidence, 0.0);
        assert!(signal.reasons[0].contains("Gathering data"));
    }

    #[test]
    fn flat_market_is_neutral() {
        let gen = SignalGenerator::new();
        let closes = vec![100.0; 60];
        let signal = gen.evaluate(&closes);
        assert_eq!(signal.action, Action::Hold);
    }

    #[test]
    fn oversold_in_uptrend_votes_long() {
        let gen = SignalGenerator::new();
        let closes = bullish_oversold_series();
        let signal = gen.evaluate(&closes);
        assert_eq!(signal.indicators.trend, Trend::Bullish);
        assert!(signal.indicators.rsi < 30.0);
        // RSI and Bollinger agree; momentum may not, but the mean stays long.
        assert_eq!(signal.action, Action::Buy);
        assert!(signal.confidence > 30.0);
    }

    #[test]
    fn oversold_in_downtrend_is_vetoed() {
        // Steady decline: RSI pinned low but the trend is BEARISH, so the
        // oversold vote must not fire and no BUY can appear.
        let mut closes: Vec<f64> = Vec::new();
        for i in 0..100 {
            closes.push(200.0 - i as f64 * 1.0);
        }
        let gen = SignalGenerator::new();
        let signal = gen.evaluate(&closes);
        assert_eq!(signal.indicators.trend, Trend::Bearish);
        assert!(signal.indicators.rsi < 30.0);
        assert_ne!(signal.action, Action::Buy);
    }

    #[test]
    fn confidence_is_scaled_vote_mean() {
        let gen = SignalGenerator::new();
        let closes = bullish_oversold_series();
        let signal = gen.evaluate(&closes);
        assert!((0.0..=100.0).contains(&signal.confidence));
    }
}
