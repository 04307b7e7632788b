//! Webhook relay — optional built-in sender for ready messages.
//! POSTs each ready message as JSON and confirms delivery on 2xx.
//! Failures leave the message ready for the next poll.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use rally_core::config::RelayConfig;
use rally_core::types::ReadyMessage;

use crate::engine::CampaignEngine;

/// HTTP webhook target.
#[derive(Debug, Clone)]
pub struct WebhookRelay {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

/// Outcome counts of one relay poll.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: usize,
    pub failed: usize,
}

impl WebhookRelay {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
            timeout,
        }
    }

    /// `None` when the relay is disabled.
    pub fn from_config(config: &RelayConfig) -> Option<Self> {
        if !config.enabled || config.webhook_url.is_empty() {
            return None;
        }
        Some(Self::new(
            &config.webhook_url,
            config.headers.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    /// POST one message. Ok only on a 2xx response.
    pub async fn deliver(&self, msg: &ReadyMessage) -> Result<(), String> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "message_id": msg.message_id,
                "operation_id": msg.operation_id,
                "target_id": msg.target_id,
                "channel": msg.channel,
                "payload": msg.payload,
                "phase": msg.phase,
                "scheduled_at": msg.scheduled_at.to_rfc3339(),
            }))
            .timeout(self.timeout);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| format!("Webhook send failed: {e}"))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("Webhook error {}", resp.status()))
        }
    }

    /// Deliver every currently ready message once.
    pub async fn relay_once(&self, engine: &CampaignEngine) -> RelayStats {
        let mut stats = RelayStats::default();
        let ready = match engine.get_ready_messages() {
            Ok(ready) => ready,
            Err(e) => {
                tracing::error!("❌ Relay could not list ready messages: {e}");
                return stats;
            }
        };

        for msg in &ready {
            match self.deliver(msg).await {
                Ok(()) => match engine.confirm_delivered(&msg.message_id) {
                    Ok(_) => {
                        tracing::info!("✅ Relayed {} to {}", msg.message_id, msg.target_id);
                        stats.sent += 1;
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ Relayed {} but confirm failed: {e}", msg.message_id);
                        stats.failed += 1;
                    }
                },
                Err(e) => {
                    tracing::warn!("⚠️ Relay of {} failed: {e}", msg.message_id);
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

/// Poll and relay every `interval` until `shutdown` flips to true.
pub async fn spawn_relay(
    engine: Arc<CampaignEngine>,
    relay: WebhookRelay,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("📤 Relay started → {} (every {}s)", relay.url, interval.as_secs());
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                relay.relay_once(&engine).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("📤 Relay stopped");
}
