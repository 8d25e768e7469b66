use crate::models::signal::Action;
use crate::signals::indicators::IndicatorSet;

/// Contract for an optional reinforcement-learning advisor.
///
/// When wired in, the advisor's action joins the deterministic indicator
/// votes with a configurable weight; it never replaces them. No trained
/// implementation ships and the generator runs correctly without one, with
/// sentiment held at zero.
pub trait Advisor: Send + Sync {
    /// Pick an action for the given state vector and sentiment in [-1, 1].
    /// Returns the action and its log-probability.
    fn select_action(&self, state: &[f64], sentiment: f64) -> (Action, f64);

    /// Estimated value of the state under the advisor's policy.
    fn value(&self, state: &[f64]) -> f64;
}

/// Flatten an indicator set into the advisor's state vector.
pub fn state_vector(indicators: &IndicatorSet, price: f64) -> Vec<f64> {
    vec![
        price,
        indicators.rsi / 100.0,
        indicators.macd_line,
        indicators.macd_signal,
        indicators.macd_histogram,
        indicators.bb_upper,
        indicators.bb_lower,
        indicators.volatility_pct,
        indicators.momentum_pct,
        indicators.atr,
    ]
}
