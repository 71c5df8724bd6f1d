mod webhook;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::AppConfig;
use crate::core::report::Outcome;

pub use webhook::WebhookSink;

/// A finished report on its way out of the node.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery<'a> {
    pub job_id: &'a str,
    pub commit_sha: &'a str,
    pub node: &'a str,
    #[serde(flatten)]
    pub outcome: &'a Outcome,
}

/// External sink for assembled reports (webhook, check-run API, ...).
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<()>;
}

/// Build the sink configured for this node, if any.
pub fn create_sink(config: &AppConfig) -> Option<Arc<dyn ReportSink>> {
    let url = config.webhook_url()?;
    Some(Arc::new(WebhookSink::new(url.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::ReportAssembler;

    #[test]
    fn no_webhook_means_no_sink() {
        assert!(create_sink(&AppConfig::default()).is_none());

        let mut config = AppConfig::default();
        config.delivery.webhook_url = Some("http://127.0.0.1:9/hook".to_string());
        assert!(create_sink(&config).is_some());
    }

    #[test]
    fn delivery_flattens_outcome() {
        let outcome = ReportAssembler::new("https://example.invalid/commit/").assemble("abc123", Vec::new());
        let delivery = Delivery {
            job_id: "job-1",
            commit_sha: "abc123",
            node: "node_1",
            outcome: &outcome,
        };

        let value = serde_json::to_value(&delivery).unwrap();
        assert_eq!(value["job_id"], "job-1");
        assert_eq!(value["conclusion"], "success");
        assert_eq!(value["output"]["title"], "RosiePi");
    }
}
