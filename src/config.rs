use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Paper => f.write_str("paper"),
            Mode::Live => f.write_str("live"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub risk: RiskConfig,
    pub portfolio: PortfolioConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub initial_capital: f64,
    /// Ordered list of tradable symbols; the first one is the primary symbol
    /// whose history feeds the black-swan detectors.
    pub symbols: Vec<String>,
    pub position_size_pct: f64,      // fraction of cash per new entry
    pub max_positions: usize,        // concurrent position cap, LONG + SHORT
    pub stop_loss_pct: f64,          // entry-relative stop distance
    pub take_profit_pct: f64,        // entry-relative target distance
    pub fee_pct: f64,                // per-fill fee
    pub slippage_pct: f64,           // market-order slippage estimate
    pub allow_short: bool,
    pub short_min_confidence: f64,   // SELL entries need at least this
    pub min_entry_confidence: f64,   // candidates below this are not ranked
    pub tick_interval_s: u64,
    pub duration_s: u64,             // 0 = unbounded
    pub snapshot_every: u64,         // ticks between session snapshots
    pub mode: Mode,
    /// Optional per-symbol ranking boost (e.g. a whitelist prior).
    pub priority_boost: HashMap<String, f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capital: 1000.0,
            symbols: vec![
                "BTC-USD".into(),
                "ETH-USD".into(),
                "SOL-USD".into(),
                "DOGE-USD".into(),
                "XRP-USD".into(),
            ],
            position_size_pct: 0.10,
            max_positions: 3,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.03,
            fee_pct: 0.001,
            slippage_pct: 0.0005,
            allow_short: true,
            short_min_confidence: 40.0,
            min_entry_confidence: 25.0,
            tick_interval_s: 30,
            duration_s: 0,
            snapshot_every: 10,
            mode: Mode::Paper,
            priority_boost: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub mdd_warning: f64,
    pub mdd_critical: f64,
    pub mdd_emergency: f64,
    pub circuit_breaker_cooldown_s: u64,
    pub black_swan_freeze_s: u64,
    pub daily_loss_limit: f64,       // loss vs initial capital
    pub global_stop_loss_pct: f64,   // hard floor vs initial capital
    pub max_position_pct: f64,       // single-symbol exposure cap
    pub vol_spike_ratio: f64,        // current vol vs baseline mean
    pub flash_crash_window: usize,   // observations for the crash check
    pub flash_crash_threshold: f64,  // fractional change, negative
    pub min_vol_samples: usize,      // baseline needed before detectors arm
    pub max_vol_samples: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            mdd_warning: 0.03,
            mdd_critical: 0.05,
            mdd_emergency: 0.08,
            circuit_breaker_cooldown_s: 3600,
            black_swan_freeze_s: 86_400,
            daily_loss_limit: 0.08,
            global_stop_loss_pct: 0.20,
            max_position_pct: 0.20,
            vol_spike_ratio: 3.0,
            flash_crash_window: 60,
            flash_crash_threshold: -0.15,
            min_vol_samples: 30,
            max_vol_samples: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    pub enabled: bool,
    /// Symbol to target weight; weights must sum to 1.
    pub target_weights: Vec<(String, f64)>,
    pub rebalance_interval_days: i64,
    pub deviation_threshold: f64,    // absolute weight deviation to act on
    pub correlation_window: usize,   // aligned returns for Pearson
    pub history_cap: usize,
    pub check_interval_s: u64,       // cadence of the weight check task
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_weights: vec![
                ("BTC-USD".into(), 0.40),
                ("ETH-USD".into(), 0.30),
                ("SOL-USD".into(), 0.15),
                ("USDC-USD".into(), 0.15),
            ],
            rebalance_interval_days: 7,
            deviation_threshold: 0.05,
            correlation_window: 30,
            history_cap: 100,
            check_interval_s: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub snapshot_dir: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub alert_on_trade: bool,
    pub alert_on_risk: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            snapshot_dir: ".".into(),
            telegram_bot_token: None,
            telegram_chat_id: None,
            discord_webhook_url: None,
            alert_on_trade: true,
            alert_on_risk: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            risk: RiskConfig::default(),
            portfolio: PortfolioConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (.env file) on top of
    /// the defaults.
    ///
    /// Recognised env vars:
    ///   STARTING_CAPITAL   - initial cash (default: 1000)
    ///   SYMBOLS            - comma-separated symbol list
    ///   TRADING_MODE       - "paper" (default) or "live"
    ///   TICK_INTERVAL_S    - control-loop period in seconds
    ///   DURATION_S         - run length in seconds, 0 = unbounded
    ///   SNAPSHOT_DIR       - where session snapshots land
    ///   PORTFOLIO_ENABLED  - "true" enables the weekly rebalancer
    ///   TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID, DISCORD_WEBHOOK_URL - alerts
    ///   RUST_LOG           - log level filter
    pub fn load_or_default() -> Self {
        let _ = dotenv::dotenv();

        let mut config = Self::default();

        if let Ok(capital) = std::env::var("STARTING_CAPITAL") {
            if let Ok(value) = capital.parse::<f64>() {
                config.engine.initial_capital = value;
            }
        }

        if let Ok(symbols) = std::env::var("SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.engine.symbols = parsed;
            }
        }

        if let Ok(mode) = std::env::var("TRADING_MODE") {
            config.engine.mode = if mode.eq_ignore_ascii_case("live") {
                Mode::Live
            } else {
                Mode::Paper
            };
        }

        if let Ok(interval) = std::env::var("TICK_INTERVAL_S") {
            if let Ok(value) = interval.parse::<u64>() {
                config.engine.tick_interval_s = value;
            }
        }

        if let Ok(duration) = std::env::var("DURATION_S") {
            if let Ok(value) = duration.parse::<u64>() {
                config.engine.duration_s = value;
            }
        }

        if let Ok(dir) = std::env::var("SNAPSHOT_DIR") {
            if !dir.is_empty() {
                config.telemetry.snapshot_dir = dir;
            }
        }

        if let Ok(enabled) = std::env::var("PORTFOLIO_ENABLED") {
            config.portfolio.enabled = enabled == "true" || enabled == "1";
        }

        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.is_empty() {
                config.telemetry.telegram_bot_token = Some(token);
            }
        }
        if let Ok(chat) = std::env::var("TELEGRAM_CHAT_ID") {
            if !chat.is_empty() {
                config.telemetry.telegram_chat_id = Some(chat);
            }
        }
        if let Ok(url) = std::env::var("DISCORD_WEBHOOK_URL") {
            if !url.is_empty() {
                config.telemetry.discord_webhook_url = Some(url);
            }
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.telemetry.log_level = level;
        }

        config
    }

    /// Fatal on any inconsistency; the process must not run on a partial
    /// configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.engine.initial_capital > 0.0,
            "initial_capital must be positive"
        );
        anyhow::ensure!(!self.engine.symbols.is_empty(), "symbol list is empty");
        anyhow::ensure!(
            self.engine.position_size_pct > 0.0 && self.engine.position_size_pct <= 1.0,
            "position_size_pct must be in (0, 1]"
        );
        anyhow::ensure!(self.engine.max_positions >= 1, "max_positions must be >= 1");
        anyhow::ensure!(
            self.engine.stop_loss_pct > 0.0 && self.engine.take_profit_pct > 0.0,
            "stop_loss_pct and take_profit_pct must be positive"
        );
        anyhow::ensure!(
            self.engine.fee_pct >= 0.0 && self.engine.slippage_pct >= 0.0,
            "fee_pct and slippage_pct must be non-negative"
        );
        anyhow::ensure!(self.engine.tick_interval_s > 0, "tick_interval_s must be > 0");
        anyhow::ensure!(
            self.risk.mdd_warning < self.risk.mdd_critical
                && self.risk.mdd_critical < self.risk.mdd_emergency,
            "drawdown thresholds must be strictly ordered: warning < critical < emergency"
        );
        anyhow::ensure!(
            self.risk.daily_loss_limit > 0.0 && self.risk.global_stop_loss_pct > 0.0,
            "loss limits must be positive"
        );
        anyhow::ensure!(
            self.risk.flash_crash_threshold < 0.0,
            "flash_crash_threshold must be negative"
        );
        let weight_sum: f64 = self.portfolio.target_weights.iter().map(|(_, w)| w).sum();
        anyhow::ensure!(
            (weight_sum - 1.0).abs() < 1e-3,
            "portfolio target weights must sum to 1, got {weight_sum}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn unordered_thresholds_are_fatal() {
        let mut config = Config::default();
        config.risk.mdd_warning = 0.06;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_symbols_are_fatal() {
        let mut config = Config::default();
        config.engine.symbols.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_capital_is_fatal() {
        let mut config = Config::default();
        config.engine.initial_capital = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn skewed_weights_are_fatal() {
        let mut config = Config::default();
        config.portfolio.target_weights[0].1 = 0.80;
        assert!(config.validate().is_err());
    }
}
