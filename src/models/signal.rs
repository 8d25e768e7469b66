use serde::{Deserialize, Serialize};

use crate::signals::indicators::IndicatorSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => f.write_str("BUY"),
            Action::Sell => f.write_str("SELL"),
            Action::Hold => f.write_str("HOLD"),
        }
    }
}

/// Price-vs-EMA200 regime gate. Counter-trend entries are vetoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Bullish => f.write_str("BULLISH"),
            Trend::Bearish => f.write_str("BEARISH"),
            Trend::Neutral => f.write_str("NEUTRAL"),
        }
    }
}

/// Synthesized trading signal for one symbol at one tick.
///
/// `confidence` is the absolute mean of the indicator votes scaled to 0-100;
/// it gates both entries and indicator-driven exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: Action,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub indicators: IndicatorSet,
}

impl Signal {
    pub fn hold(indicators: IndicatorSet, reason: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.0,
            reasons: vec![reason.into()],
            indicators,
        }
    }

    /// True when this signal points against an open position on `side`.
    pub fn opposes(&self, side: crate::models::position::Side) -> bool {
        matches!(
            (side, self.action),
            (crate::models::position::Side::Long, Action::Sell)
                | (crate::models::position::Side::Short, Action::Buy)
        )
    }
}
