use super::{Delivery, ReportSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// POSTs each report as JSON to a fixed URL.
pub struct WebhookSink {
    webhook_url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReportSink for WebhookSink {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(delivery)
            .send()
            .await
            .with_context(|| format!("Failed to reach report webhook {}", self.webhook_url))?;

        let status = response.status();
        response
            .error_for_status()
            .with_context(|| format!("Report webhook rejected delivery with {status}"))?;

        debug!(job_id = delivery.job_id, status = %status, "Report delivered");
        Ok(())
    }
}
