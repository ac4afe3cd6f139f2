use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::models::{Action, IncomingMessage};

/// Outbound webhook for moderator escalations. Failures are logged and
/// swallowed; notification delivery never affects the decision path.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl Notifier {
    pub fn new(webhook_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build notification client: {e}"))?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    pub async fn notify(&self, msg: &IncomingMessage, action: &Action) {
        let payload = json!({
            "action": action.kind.as_str(),
            "severity": action.severity.as_str(),
            "user_id": msg.user_id,
            "channel_id": msg.channel_id,
            "message_id": msg.message_id.to_string(),
            "reason": action.reason,
        });

        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                metrics::counter!("notifications_sent_total", 1);
            }
            Ok(response) => {
                warn!(status = %response.status(), "notification webhook rejected payload");
                metrics::counter!("notifications_failed_total", 1);
            }
            Err(e) => {
                warn!(error = %e, "notification webhook unreachable");
                metrics::counter!("notifications_failed_total", 1);
            }
        }
    }
}
