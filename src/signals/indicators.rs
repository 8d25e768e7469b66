//! Pure technical-indicator math over a rolling close-price series.
//!
//! Every function clamps its window to the available history (lower bound of
//! 5 samples) and falls back to a documented neutral default when even that
//! much is missing: RSI 50, MACD zeros, Bollinger collapsed onto the last
//! price, trend NEUTRAL.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::models::signal::Trend;

pub const RSI_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const ATR_PERIOD: usize = 14;
pub const VOLATILITY_PERIOD: usize = 14;
pub const MOMENTUM_LOOKBACK: usize = 10;

/// All derived indicators for one symbol at one tick. Recomputed from the
/// price history every tick; no cross-tick state lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub rsi: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bb_upper: f64,
    pub bb_mid: f64,
    pub bb_lower: f64,
    pub ema_200: f64,
    pub atr: f64,
    pub volatility_pct: f64,
    pub momentum_pct: f64,
    pub trend: Trend,
}

impl IndicatorSet {
    pub fn compute(closes: &[f64]) -> Self {
        let last = closes.last().copied().unwrap_or(0.0);
        let (macd_line, macd_signal, macd_histogram) = macd(closes);
        let (bb_upper, bb_mid, bb_lower) = bollinger_bands(closes, BOLLINGER_PERIOD);
        let ema_200 = ema_200(closes);
        Self {
            rsi: rsi(closes, RSI_PERIOD),
            macd_line,
            macd_signal,
            macd_histogram,
            bb_upper,
            bb_mid,
            bb_lower,
            ema_200,
            atr: atr(closes, ATR_PERIOD),
            volatility_pct: volatility_pct(closes, VOLATILITY_PERIOD),
            momentum_pct: momentum_pct(closes),
            trend: trend(last, ema_200),
        }
    }

    /// Neutral set anchored on a price, used before any history exists.
    pub fn neutral(price: f64) -> Self {
        Self {
            rsi: 50.0,
            macd_line: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            bb_upper: price,
            bb_mid: price,
            bb_lower: price,
            ema_200: price,
            atr: 0.0,
            volatility_pct: 0.0,
            momentum_pct: 0.0,
            trend: Trend::Neutral,
        }
    }
}

/// RSI over mean absolute gains/losses of the last `period` deltas.
/// Returns 100 when there were no losses, 50 with insufficient history.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    let n = closes.len();
    if n < 2 {
        return 50.0;
    }
    let actual = period.min((n - 1).max(5));
    if n < actual + 1 {
        return 50.0;
    }
    let window = &closes[n - actual - 1..];
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gain_sum += delta;
        } else {
            loss_sum += -delta;
        }
    }
    let avg_gain = gain_sum / actual as f64;
    let avg_loss = loss_sum / actual as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Recursive EMA seeded with the first element, smoothing 2/(period+1).
/// Falls back to the arithmetic mean when the series is shorter than `period`.
pub fn ema(values: &[f64], period: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() < period {
        return values.iter().mean();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[0];
    for &value in &values[1..] {
        ema = value * multiplier + ema * (1.0 - multiplier);
    }
    ema
}

fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut ema = match values.first() {
        Some(&first) => first,
        None => return out,
    };
    out.push(ema);
    for &value in &values[1..] {
        ema = value * multiplier + ema * (1.0 - multiplier);
        out.push(ema);
    }
    out
}

/// MACD line, signal line, and histogram.
///
/// Periods scale down with short histories (fast 5..=12, slow 10..=26,
/// signal 3..=9). The signal line is the EMA of the point-by-point MACD
/// series, not of a single value.
pub fn macd(closes: &[f64]) -> (f64, f64, f64) {
    let n = closes.len();
    if n < 15 {
        return (0.0, 0.0, 0.0);
    }
    let fast = 12.min((n / 2).max(5));
    let slow = 26.min((n - 1).max(10));
    let signal = 9.min((n / 3).max(3));

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    let macd_series: Vec<f64> = fast_series
        .iter()
        .zip(&slow_series)
        .map(|(f, s)| f - s)
        .collect();

    let macd_line = macd_series.last().copied().unwrap_or(0.0);
    let signal_line = ema(&macd_series, signal);
    (macd_line, signal_line, macd_line - signal_line)
}

/// SMA +/- 2 population standard deviations over the last `period` closes.
/// Collapses onto the last price when fewer than 5 samples exist.
pub fn bollinger_bands(closes: &[f64], period: usize) -> (f64, f64, f64) {
    let n = closes.len();
    let actual = period.min(n.max(5));
    if n < actual {
        let price = closes.last().copied().unwrap_or(0.0);
        return (price, price, price);
    }
    let recent = &closes[n - actual..];
    let sma = recent.iter().mean();
    let std = recent.iter().population_std_dev();
    (sma + 2.0 * std, sma, sma - 2.0 * std)
}

/// Close-to-close ATR: mean absolute move over the last `period` deltas.
/// True range is approximated from closes because ticks carry no OHLC.
pub fn atr(closes: &[f64], period: usize) -> f64 {
    let n = closes.len();
    if n < 2 {
        return 0.0;
    }
    let actual = period.min(n - 1);
    if actual < 2 {
        return 0.0;
    }
    let start = n - actual - 1;
    let window = &closes[start..];
    let sum: f64 = window.windows(2).map(|p| (p[1] - p[0]).abs()).sum();
    sum / actual as f64
}

/// EMA of the full history capped at 200 periods. Below 50 samples the trend
/// anchor is just the last price, which renders the trend filter NEUTRAL.
pub fn ema_200(closes: &[f64]) -> f64 {
    let n = closes.len();
    if n < 50 {
        return closes.last().copied().unwrap_or(0.0);
    }
    ema(closes, 200.min(n))
}

/// Population stdev of simple returns over the last `period` samples, as %.
pub fn volatility_pct(closes: &[f64], period: usize) -> f64 {
    let n = closes.len();
    let actual = period.min(n);
    if actual < 2 {
        return 0.0;
    }
    let recent = &closes[n - actual..];
    let returns: Vec<f64> = recent
        .windows(2)
        .filter(|p| p[0] != 0.0)
        .map(|p| (p[1] - p[0]) / p[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().population_std_dev() * 100.0
}

/// Percent move against the price 10 samples back; 0 until enough history.
pub fn momentum_pct(closes: &[f64]) -> f64 {
    let n = closes.len();
    if n < MOMENTUM_LOOKBACK {
        return 0.0;
    }
    let base = closes[n - MOMENTUM_LOOKBACK];
    if base == 0.0 {
        return 0.0;
    }
    (closes[n - 1] - base) / base * 100.0
}

/// BULLISH above EMA200 * 1.02, BEARISH below EMA200 * 0.98, else NEUTRAL.
pub fn trend(price: f64, ema_200: f64) -> Trend {
    if ema_200 <= 0.0 {
        return Trend::Neutral;
    }
    if price > ema_200 * 1.02 {
        Trend::Bullish
    } else if price < ema_200 * 0.98 {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: f64, step: f64, len: usize) -> Vec<f64> {
        (0..len).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn rsi_defaults_to_neutral_on_short_history() {
        assert_eq!(rsi(&[100.0], RSI_PERIOD), 50.0);
        assert_eq!(rsi(&[100.0, 101.0, 102.0], RSI_PERIOD), 50.0);
    }

    #[test]
    fn rsi_saturates_at_100_on_monotonic_rise() {
        let closes = ramp(100.0, 1.0, 20);
        assert_eq!(rsi(&closes, RSI_PERIOD), 100.0);
    }

    #[test]
    fn rsi_is_bounded() {
        let closes = vec![
            100.0, 102.0, 101.0, 103.0, 105.0, 104.0, 106.0, 108.0, 107.0, 109.0, 111.0, 110.0,
            112.0, 114.0, 113.0,
        ];
        let value = rsi(&closes, RSI_PERIOD);
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn ema_falls_back_to_mean_below_period() {
        let values = vec![1.0, 2.0, 3.0];
        assert!((ema(&values, 10) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn macd_is_zero_below_fifteen_samples() {
        let closes = ramp(100.0, 1.0, 14);
        assert_eq!(macd(&closes), (0.0, 0.0, 0.0));
    }

    #[test]
    fn macd_line_positive_in_uptrend() {
        let closes = ramp(100.0, 2.0, 60);
        let (line, signal, hist) = macd(&closes);
        assert!(line > 0.0);
        assert!(signal > 0.0);
        assert!((line - signal - hist).abs() < 1e-12);
    }

    #[test]
    fn bollinger_collapses_without_history() {
        let (upper, mid, lower) = bollinger_bands(&[100.0, 101.0], BOLLINGER_PERIOD);
        assert_eq!(upper, 101.0);
        assert_eq!(mid, 101.0);
        assert_eq!(lower, 101.0);
    }

    #[test]
    fn bollinger_brackets_the_mean() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let (upper, mid, lower) = bollinger_bands(&closes, BOLLINGER_PERIOD);
        assert!(upper > mid && mid > lower);
        assert!((mid - 100.0).abs() < 1e-9);
    }

    #[test]
    fn atr_matches_mean_absolute_move() {
        let closes = vec![100.0, 102.0, 99.0, 101.0];
        // deltas: 2, 3, 2 -> mean 7/3
        assert!((atr(&closes, ATR_PERIOD) - 7.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn momentum_requires_ten_samples() {
        assert_eq!(momentum_pct(&ramp(100.0, 1.0, 9)), 0.0);
        let closes = ramp(100.0, 1.0, 10);
        // (109 - 100) / 100 * 100
        assert!((momentum_pct(&closes) - 9.0).abs() < 1e-9);
    }

    #[test]
    fn trend_bands_around_ema() {
        assert_eq!(trend(103.0, 100.0), Trend::Bullish);
        assert_eq!(trend(97.0, 100.0), Trend::Bearish);
        assert_eq!(trend(101.0, 100.0), Trend::Neutral);
        assert_eq!(trend(100.0, 0.0), Trend::Neutral);
    }

    #[test]
    fn compute_handles_empty_series() {
        let set = IndicatorSet::compute(&[]);
        assert_eq!(set.rsi, 50.0);
        assert_eq!(set.trend, Trend::Neutral);
        assert_eq!(set.atr, 0.0);
    }
}
