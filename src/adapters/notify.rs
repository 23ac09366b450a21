//! Operator notification channels.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::error;

use super::{OperatorAlert, OperatorNotifier};

/// Emits alerts as `error!` events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn alert(&self, alert: &OperatorAlert) -> Result<()> {
        error!(
            intent_id = %alert.intent_id,
            correlation_id = %alert.correlation_id,
            template = %alert.template_name,
            step = alert.step_sequence,
            action = %alert.action,
            reason = %alert.reason,
            "Operator intervention required"
        );
        Ok(())
    }
}

/// Posts alerts as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl OperatorNotifier for WebhookNotifier {
    async fn alert(&self, alert: &OperatorAlert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("Failed to send operator alert")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Operator webhook returned {}: {}", status, body);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let alert = OperatorAlert {
            intent_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            template_name: "deployment".to_string(),
            step_sequence: 4,
            action: "deployment:execute:rollback".to_string(),
            reason: "revert script exited 1".to_string(),
            occurred_at: Utc::now(),
        };
        assert!(LogNotifier.alert(&alert).await.is_ok());
    }
}
