use async_trait::async_trait;
use correlator_core::error::PipelineError;
use correlator_core::notify::NotificationChannel;
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// Delivers notifications by POSTing to a chat/webhook endpoint.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        WebhookChannel {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), PipelineError> {
        let payload = json!({
            "recipient": recipient,
            "subject": subject,
            "body": body,
        });
        self.client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::NotificationDeliveryFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| PipelineError::NotificationDeliveryFailed(e.to_string()))?;
        Ok(())
    }
}

/// Fallback channel when no webhook is configured: notifications land in
/// the log instead of disappearing.
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        _body: &str,
    ) -> Result<(), PipelineError> {
        info!(recipient, subject, "notification (log channel)");
        Ok(())
    }
}
