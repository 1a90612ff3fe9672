//! Import completion callbacks
//!
//! A handler is invoked on a detached task once per import, after the first
//! successful submit.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::models::SubmittedImport;

/// Receives submitted imports
#[async_trait]
pub trait ImportCompleteHandler: Send + Sync {
    async fn on_import_complete(&self, import: SubmittedImport) -> Result<()>;
}

/// POSTs the submitted import as JSON to a fixed URL
pub struct WebhookNotifier {
    http_client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("tabflow-fi/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ImportCompleteHandler for WebhookNotifier {
    async fn on_import_complete(&self, import: SubmittedImport) -> Result<()> {
        tracing::debug!(
            import_id = %import.import.id,
            url = %self.url,
            "Posting submitted import to webhook"
        );

        let response = self
            .http_client
            .post(&self.url)
            .json(&import)
            .send()
            .await
            .context("Webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Webhook returned {}: {}", status, body);
        }

        Ok(())
    }
}
