//! HTTP webhook announcing freshly loaded jobs.

use async_trait::async_trait;
use repo_cron_core::contract::{CollaboratorError, Webhook};

pub struct HttpWebhook {
    http: reqwest::Client,
    url: String,
}

impl HttpWebhook {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Webhook for HttpWebhook {
    /// POST the shard metadata bytes as JSON.
    async fn notify(&self, payload: Vec<u8>) -> Result<(), CollaboratorError> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("webhook {} responded with {status}", self.url).into());
        }
        tracing::info!(url = %self.url, "Webhook notified");
        Ok(())
    }
}
