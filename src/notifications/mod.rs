use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

mod pushover;
mod webhook;

pub use pushover::PushoverNotifier;
pub use webhook::WebhookNotifier;

use crate::config::Settings;

/// One notification category, mirroring the event log entries the action
/// engine accumulates per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationCategory {
    Update,
    Restart,
    Recreate,
    Health,
    Startup,
    Detect,
    Prune,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Restart => "restart",
            Self::Recreate => "recreate",
            Self::Health => "health",
            Self::Startup => "startup",
            Self::Detect => "detect",
            Self::Prune => "prune",
        }
    }
}

/// A single outbound transport. Both Pushover and webhook implement this,
/// narrowed from the teacher's Slack/Teams/Webhook trio to the two transports
/// this daemon actually speaks.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, title: &str, message: &str) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
}

/// Batches per-tick event strings and flushes them as one notification per
/// enabled transport, plus a separately rate-limited detection batch.
pub struct NotificationDispatcher {
    notifiers: Vec<Box<dyn Notifier>>,
    enabled_categories: std::collections::HashSet<String>,
    hostname: String,
    last_detect_flush: Mutex<Option<DateTime<Utc>>>,
}

const DETECT_FLUSH_MIN_INTERVAL: Duration = Duration::from_secs(60);

impl NotificationDispatcher {
    pub fn new(settings: &Settings) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

        match PushoverNotifier::new(settings) {
            Ok(Some(notifier)) => notifiers.push(Box::new(notifier)),
            Ok(None) => {}
            Err(error) => error!("failed to create Pushover notifier: {error}"),
        }
        match WebhookNotifier::new(settings) {
            Ok(Some(notifier)) => notifiers.push(Box::new(notifier)),
            Ok(None) => {}
            Err(error) => error!("failed to create webhook notifier: {error}"),
        }

        info!("notification dispatcher initialized with {} transport(s)", notifiers.len());

        Self {
            notifiers,
            enabled_categories: settings.notifications.clone(),
            hostname: settings.hostname.clone(),
            last_detect_flush: Mutex::new(None),
        }
    }

    pub fn category_enabled(&self, category: NotificationCategory) -> bool {
        self.enabled_categories.contains(category.as_str())
    }

    /// Sends one notification per transport with a title derived from the
    /// hostname and a body of newline-joined events. A no-op if `events` is
    /// empty or no transport is configured.
    pub async fn flush(&self, events: &[String]) {
        if events.is_empty() || self.notifiers.is_empty() {
            return;
        }
        let title = format!("Guerite on {}", self.hostname);
        let body = events.join("\n");
        for notifier in &self.notifiers {
            if let Err(error) = notifier.send(&title, &body).await {
                error!("failed to send notification via {}: {error}", notifier.name());
            }
        }
    }

    /// Like `flush`, but rate-limited to at most once per 60s, per §4.10.
    pub async fn flush_detections(&self, events: &[String]) {
        if events.is_empty() {
            return;
        }
        {
            let mut last = self.last_detect_flush.lock().expect("detect-flush mutex poisoned");
            let now = Utc::now();
            if let Some(previous) = *last {
                if now.signed_duration_since(previous).to_std().unwrap_or(Duration::ZERO) < DETECT_FLUSH_MIN_INTERVAL {
                    return;
                }
            }
            *last = Some(now);
        }
        self.flush(events).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_as_str_matches_the_settings_vocabulary() {
        assert_eq!(NotificationCategory::Update.as_str(), "update");
        assert_eq!(NotificationCategory::Health.as_str(), "health");
    }

    #[test]
    fn dispatcher_respects_the_enabled_category_set() {
        let mut settings = Settings::default();
        settings.notifications = ["update".to_string(), "prune".to_string()].into_iter().collect();
        let dispatcher = NotificationDispatcher::new(&settings);
        assert!(dispatcher.category_enabled(NotificationCategory::Update));
        assert!(!dispatcher.category_enabled(NotificationCategory::Restart));
    }
}
