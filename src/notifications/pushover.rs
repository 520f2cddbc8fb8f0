use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::Settings;

use super::Notifier;

const MAX_RETRIES: u32 = 3;

/// Posts `token`/`user`/`title`/`message` as a form-urlencoded body, matching
/// the reference implementation's `notify_pushover`.
pub struct PushoverNotifier {
    api_url: String,
    token: String,
    user: String,
    client: Client,
}

impl PushoverNotifier {
    /// Returns `Ok(None)` when either credential is missing.
    pub fn new(settings: &Settings) -> Result<Option<Self>> {
        let (Some(token), Some(user)) = (settings.pushover_token.clone(), settings.pushover_user.clone()) else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.notification_timeout_seconds))
            .build()
            .context("failed to build Pushover HTTP client")?;
        Ok(Some(Self { api_url: settings.pushover_api.clone(), token, user, client }))
    }

    async fn send_with_retry(&self, title: &str, message: &str) -> Result<()> {
        let form = [
            ("token", self.token.as_str()),
            ("user", self.user.as_str()),
            ("title", title),
            ("message", message),
        ];

        let mut last_error = None;
        let mut backoff_ms = 1000u64;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                debug!("retrying Pushover notification (attempt {attempt}/{MAX_RETRIES})");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
            }

            match self.client.post(&self.api_url).form(&form).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    warn!("Pushover returned status {status}");
                    last_error = Some(anyhow!("Pushover returned non-success status: {status}"));
                }
                Err(error) => {
                    warn!("failed to send Pushover notification: {error}");
                    last_error = Some(anyhow!("Pushover request failed: {error}"));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Pushover notification failed after all retries")))
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn send(&self, title: &str, message: &str) -> Result<()> {
        self.send_with_retry(title, message).await
    }

    fn name(&self) -> &'static str {
        "pushover"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_yield_no_notifier() {
        let settings = Settings::default();
        let notifier = PushoverNotifier::new(&settings).unwrap();
        assert!(notifier.is_none());
    }

    #[test]
    fn partial_credentials_still_yield_no_notifier() {
        let mut settings = Settings::default();
        settings.pushover_token = Some("token".to_string());
        let notifier = PushoverNotifier::new(&settings).unwrap();
        assert!(notifier.is_none());
    }

    #[test]
    fn full_credentials_yield_a_notifier() {
        let mut settings = Settings::default();
        settings.pushover_token = Some("token".to_string());
        settings.pushover_user = Some("user".to_string());
        let notifier = PushoverNotifier::new(&settings).unwrap();
        assert!(notifier.is_some());
        assert_eq!(notifier.unwrap().name(), "pushover");
    }
}
