#![allow(dead_code)]

mod config;
mod feeds;
mod models;
mod portfolio;
mod risk;
mod signals;
mod telemetry;
mod trading;

use crate::config::{Config, Mode};
use crate::feeds::consensus::QuoteResolver;
use crate::portfolio::manager::PortfolioManager;
use crate::telemetry::alerts::AlertManager;
use crate::trading::scheduler::Scheduler;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("================================================");
    info!("  VIGIL - capital-preserving crypto trader");
    info!("================================================");

    let config = Config::load_or_default();
    if let Err(e) = config.validate() {
        error!("config validation failed: {e}");
        return Err(e);
    }

    if config.engine.mode == Mode::Live {
        warn!("live mode selected but no exchange order adapter is wired in;");
        warn!("fills will be simulated at the slippage-adjusted price");
    }

    info!("--- engine ---");
    info!("  mode:          {}", config.engine.mode);
    info!("  capital:       ${:.2}", config.engine.initial_capital);
    info!("  symbols:       {}", config.engine.symbols.join(", "));
    info!("  position size: {}%", config.engine.position_size_pct * 100.0);
    info!(
        "  stop/take:     {}% / {}%",
        config.engine.stop_loss_pct * 100.0,
        config.engine.take_profit_pct * 100.0
    );
    info!("  max positions: {}", config.engine.max_positions);
    info!("  tick interval: {}s", config.engine.tick_interval_s);

    info!("--- risk ---");
    info!(
        "  drawdown levels: {}% / {}% / {}%",
        config.risk.mdd_warning * 100.0,
        config.risk.mdd_critical * 100.0,
        config.risk.mdd_emergency * 100.0
    );
    info!(
        "  daily loss: {}%  global stop: {}%",
        config.risk.daily_loss_limit * 100.0,
        config.risk.global_stop_loss_pct * 100.0
    );
    info!(
        "  breaker: {}s  freeze: {}s",
        config.risk.circuit_breaker_cooldown_s, config.risk.black_swan_freeze_s
    );

    let resolver = Arc::new(QuoteResolver::with_default_sources());
    let alerts = Arc::new(AlertManager::new(config.telemetry.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Optional weekly rebalancer runs beside the trader on its own cadence.
    if config.portfolio.enabled {
        let mut manager = PortfolioManager::new(
            config.portfolio.clone(),
            Arc::clone(&resolver),
            config.engine.initial_capital,
        );
        let check_interval = config.portfolio.check_interval_s;
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(check_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.run_cycle().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        info!("portfolio rebalancer enabled");
    }

    // Ctrl-C feeds the cooperative cancellation signal.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let mut scheduler = Scheduler::new(config, resolver, alerts);
    let result = scheduler.run(shutdown_tx.subscribe()).await;

    match &result {
        Ok(()) => info!("vigil shutdown complete"),
        Err(e) => error!("vigil halted: {e}"),
    }
    result
}
