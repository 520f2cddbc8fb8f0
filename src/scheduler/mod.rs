use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::clock;
use crate::config::Settings;
use crate::view::ContainerSnapshot;

/// Where the current tick's wake came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
    Startup,
    Schedule { name: Option<String>, label: Option<String> },
    DockerEvent,
    HttpApi,
}

/// Next instant at which some scheduled action is due, and which
/// container/label caused it (ties broken by earliest).
pub struct NextWake {
    pub at: DateTime<Utc>,
    pub name: Option<String>,
    pub label: Option<String>,
}

fn schedule_labels(settings: &Settings) -> [(&str, &str); 4] {
    [
        (settings.update_label.as_str(), "update"),
        (settings.restart_label.as_str(), "restart"),
        (settings.recreate_label.as_str(), "recreate"),
        (settings.health_label.as_str(), "health"),
    ]
}

/// Computes the next wake instant across every container's schedule labels
/// plus the global prune cron, defaulting to `reference + 300s` if nothing
/// is scheduled at all.
pub fn next_wake(containers: &[ContainerSnapshot], settings: &Settings, reference: DateTime<Utc>) -> NextWake {
    let mut best: Option<(DateTime<Utc>, Option<String>, Option<String>)> = None;

    for container in containers {
        for (label_key, label_slot) in schedule_labels(settings) {
            let Some(expr) = container.label(label_key) else { continue };
            let warn_key = format!("{}:{}", container.id, label_slot);
            if let Some(next_time) = clock::next(expr, reference, &warn_key) {
                if best.as_ref().is_none_or(|(at, _, _)| next_time < *at) {
                    best = Some((next_time, Some(container.name.clone()), Some(label_slot.to_string())));
                }
            }
        }
    }

    if let Some(prune_cron) = &settings.prune_cron {
        if let Some(next_time) = clock::next(prune_cron, reference, "prune") {
            if best.as_ref().is_none_or(|(at, _, _)| next_time < *at) {
                best = Some((next_time, None, Some("prune".to_string())));
            }
        }
    }

    match best {
        Some((at, name, label)) => NextWake { at, name, label },
        None => NextWake { at: reference + chrono::Duration::seconds(300), name: None, label: None },
    }
}

fn short_label(label: &str) -> &str {
    label.strip_prefix("guerite.").unwrap_or(label)
}

fn format_human(at: DateTime<Utc>, reference: DateTime<Utc>) -> String {
    let reference_date = reference.date_naive();
    let at_date = at.date_naive();
    let prefix = if at_date == reference_date {
        "today".to_string()
    } else if at_date == reference_date + chrono::Duration::days(1) {
        "tomorrow".to_string()
    } else {
        at_date.to_string()
    };
    format!("{prefix} {}", at.format("%H:%M"))
}

/// Up to ten upcoming events, formatted for the startup log line.
pub fn schedule_summary(containers: &[ContainerSnapshot], settings: &Settings, reference: DateTime<Utc>) -> Vec<String> {
    let mut events: Vec<(DateTime<Utc>, String, &str)> = Vec::new();

    for container in containers {
        for (label_key, label_slot) in schedule_labels(settings) {
            let Some(expr) = container.label(label_key) else { continue };
            let warn_key = format!("{}:{}", container.id, label_slot);
            if let Some(next_time) = clock::next(expr, reference, &warn_key) {
                events.push((next_time, container.name.clone(), label_key));
            }
        }
    }

    events.sort_by_key(|(at, _, _)| *at);
    events
        .into_iter()
        .take(10)
        .map(|(at, name, label)| format!("{} {name} ({})", format_human(at, reference), short_label(label)))
        .collect()
}

/// Shared wake signal: the Event Listener and Control API both call
/// `notify_one` on this to interrupt the scheduler's sleep.
pub fn wake_signal() -> Arc<Notify> {
    Arc::new(Notify::new())
}

/// Waits until either `at` arrives or `wake` fires, whichever is first.
/// Returns `true` if the wake fired before the deadline.
pub async fn interruptible_wait(at: DateTime<Utc>, wake: &Notify) -> bool {
    let remaining = (at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
    tokio::select! {
        _ = tokio::time::sleep(remaining) => false,
        _ = wake.notified() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::HealthStatus;
    use std::collections::HashMap;

    fn container_with_label(id: &str, label: &str, expr: &str) -> ContainerSnapshot {
        let mut labels = HashMap::new();
        labels.insert(label.to_string(), expr.to_string());
        ContainerSnapshot {
            id: id.to_string(),
            name: id.to_string(),
            base_name: id.to_string(),
            compose_project: None,
            image_id: "sha256:x".to_string(),
            image_ref: "demo:latest".to_string(),
            labels,
            running: true,
            health_status: HealthStatus::Healthy,
            started_at: None,
            has_healthcheck: false,
            healthcheck_test: None,
            host_config: crate::view::HostConfig::default(),
            mounts: Vec::new(),
            networks: Vec::new(),
            platform_managed: false,
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn defaults_to_300_seconds_when_nothing_is_scheduled() {
        let settings = Settings::default();
        let reference = Utc::now();
        let wake = next_wake(&[], &settings, reference);
        assert_eq!(wake.at, reference + chrono::Duration::seconds(300));
        assert!(wake.name.is_none());
    }

    #[test]
    fn picks_the_earliest_candidate_across_containers() {
        let settings = Settings::default();
        let reference = Utc::now();
        let containers = vec![
            container_with_label("a", &settings.update_label, "0 6 * * *"),
            container_with_label("b", &settings.restart_label, "0 3 * * *"),
        ];
        let wake = next_wake(&containers, &settings, reference);
        assert_eq!(wake.name.as_deref(), Some("b"));
        assert_eq!(wake.label.as_deref(), Some("restart"));
    }

    #[test]
    fn schedule_summary_caps_at_ten_entries() {
        let settings = Settings::default();
        let reference = Utc::now();
        let containers: Vec<_> = (0..15)
            .map(|i| container_with_label(&format!("c{i}"), &settings.update_label, "*/5 * * * *"))
            .collect();
        let summary = schedule_summary(&containers, &settings, reference);
        assert!(summary.len() <= 10);
    }
}
