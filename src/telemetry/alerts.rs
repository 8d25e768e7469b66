//! Optional Telegram / Discord webhook alerts for risk transitions and
//! closed trades. Unconfigured channels are silently skipped; delivery
//! failures are logged and never propagate.

use anyhow::Result;
use tracing::{error, info};

use crate::config::TelemetryConfig;
use crate::models::position::Fill;
use crate::risk::risk_manager::RiskLevel;

pub struct AlertManager {
    config: TelemetryConfig,
    http: reqwest::Client,
}

impl AlertManager {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub async fn send(&self, message: &str) {
        info!("ALERT: {message}");

        if let Err(e) = self.send_telegram(message).await {
            error!("telegram alert failed: {e}");
        }
        if let Err(e) = self.send_discord(message).await {
            error!("discord alert failed: {e}");
        }
    }

    pub async fn on_risk(&self, level: RiskLevel, detail: &str) {
        if self.config.alert_on_risk {
            self.send(&format!("risk {level}: {detail}")).await;
        }
    }

    pub async fn on_close(&self, fill: &Fill) {
        if self.config.alert_on_trade {
            let pnl = fill.pnl.unwrap_or(0.0);
            self.send(&format!(
                "{} {} {} @ {:.4} pnl {:+.4}",
                fill.reason, fill.symbol, fill.quantity, fill.execution_price, pnl
            ))
            .await;
        }
    }

    async fn send_telegram(&self, message: &str) -> Result<()> {
        let (Some(token), Some(chat_id)) = (
            &self.config.telegram_bot_token,
            &self.config.telegram_chat_id,
        ) else {
            return Ok(());
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": format!("VIGIL: {message}"),
        });
        self.http.post(&url).json(&body).send().await?;
        Ok(())
    }

    async fn send_discord(&self, message: &str) -> Result<()> {
        let Some(webhook_url) = &self.config.discord_webhook_url else {
            return Ok(());
        };

        let body = serde_json::json!({
            "content": format!("**VIGIL**: {message}"),
        });
        self.http.post(webhook_url).json(&body).send().await?;
        Ok(())
    }
}
