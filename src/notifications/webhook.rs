use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;

use super::Notifier;

const MAX_RETRIES: u32 = 3;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
}

/// Posts a plain JSON body with no signing, matching the reference
/// implementation's unsigned webhook notifications.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    /// Returns `Ok(None)` when no webhook URL is configured.
    pub fn new(settings: &Settings) -> Result<Option<Self>> {
        let Some(url) = settings.webhook_url.clone() else { return Ok(None) };
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.notification_timeout_seconds))
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Some(Self { url, client }))
    }

    async fn send_with_retry(&self, title: &str, message: &str) -> Result<()> {
        let payload = WebhookPayload { title, message };
        let mut last_error = None;
        let mut backoff_ms = 1000u64;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                debug!("retrying webhook notification (attempt {attempt}/{MAX_RETRIES})");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
            }

            match self.client.post(&self.url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    warn!("webhook returned status {status}");
                    last_error = Some(anyhow!("webhook returned non-success status: {status}"));
                }
                Err(error) => {
                    warn!("failed to send webhook notification: {error}");
                    last_error = Some(anyhow!("webhook request failed: {error}"));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("webhook notification failed after all retries")))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, title: &str, message: &str) -> Result<()> {
        self.send_with_retry(title, message).await
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_url_yields_no_notifier() {
        let settings = Settings::default();
        let notifier = WebhookNotifier::new(&settings).unwrap();
        assert!(notifier.is_none());
    }

    #[test]
    fn configured_url_yields_a_notifier() {
        let mut settings = Settings::default();
        settings.webhook_url = Some("https://example.com/hook".to_string());
        let notifier = WebhookNotifier::new(&settings).unwrap();
        assert!(notifier.is_some());
        assert_eq!(notifier.unwrap().name(), "webhook");
    }
}
