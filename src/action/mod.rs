mod hooks;
mod prune;
mod recreate;
mod upgrade;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::dependency;
use crate::engine::ContainerEngine;
use crate::metrics::Metrics;
use crate::notifications::{NotificationCategory, NotificationDispatcher};
use crate::scheduler::WakeReason;
use crate::state::{HealthBackoffMap, KnownContainers, StateStore, UpgradeMap};
use crate::view::{self, ContainerSnapshot};

pub use recreate::{RecreateOutcome, recreate};

fn is_rollback_container_name(name: &str) -> bool {
    name.contains("-guerite-old-") || name.contains("-guerite-new-")
}

/// All in-memory mutable state the action engine threads between ticks.
/// Guarded by a single mutex (§5) distinct from the metrics mutex.
#[derive(Debug, Default)]
pub struct EngineState {
    pub health_backoff: HealthBackoffMap,
    pub upgrade: UpgradeMap,
    pub known: KnownContainers,
    pub fail_count: HashMap<String, u32>,
    pub restart_backoff: HashMap<String, DateTime<Utc>>,
    pub last_action: HashMap<String, DateTime<Utc>>,
    pub in_flight: HashSet<String>,
    pub guerite_created: HashSet<String>,
}

/// One of the four cron-driven slots a container can be due for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueAction {
    Update,
    Recreate,
    Restart,
    Health,
}

pub struct ActionEngine<E: ContainerEngine> {
    pub engine: Arc<E>,
    pub settings: Settings,
    pub state_store: StateStore,
    pub metrics: Arc<Metrics>,
    pub notifier: Arc<NotificationDispatcher>,
    pub state: tokio::sync::Mutex<EngineState>,
}

impl<E: ContainerEngine> ActionEngine<E> {
    pub fn new(
        engine: Arc<E>,
        settings: Settings,
        state_store: StateStore,
        metrics: Arc<Metrics>,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        Self { engine, settings, state_store, metrics, notifier, state: tokio::sync::Mutex::new(EngineState::default()) }
    }

    /// Loads persisted state into memory. Call once at startup.
    pub async fn load_state(&self) {
        let mut state = self.state.lock().await;
        state.health_backoff = self.state_store.load_health().await;
        state.upgrade = self.state_store.load_upgrade().await;
        state.known = self.state_store.load_known().await;
    }

    /// Runs one full tick per §4.6.1.
    pub async fn tick(&self, reason: &WakeReason) -> anyhow::Result<()> {
        info!(?reason, "tick starting");
        self.metrics.incr_scans_total();

        let mut event_log: Vec<String> = Vec::new();
        let mut detect_log: Vec<String> = Vec::new();

        upgrade::reconcile(self, &mut event_log).await;

        let prune_due = self
            .settings
            .prune_cron
            .as_deref()
            .map(|expr| crate::clock::matches(expr, Utc::now(), "prune"))
            .unwrap_or(false);

        let all_containers = match self.engine.list(&self.schedule_label_filters()).await {
            Ok(containers) => containers,
            Err(error) => {
                warn!("failed to list containers: {error}");
                self.metrics.incr_scans_skipped();
                return Ok(());
            }
        };
        let selected = view::select(all_containers, &self.settings);
        self.metrics.add_containers_scanned(selected.len() as u64);

        self.track_known_containers(&selected, &mut detect_log).await;

        let ordered = dependency::order(selected);
        let mut running_by_base: HashMap<String, bool> = HashMap::new();
        let mut healthy_by_base: HashMap<String, bool> = HashMap::new();
        for container in &ordered {
            running_by_base.insert(container.base_name.clone(), container.running);
            healthy_by_base.insert(
                container.base_name.clone(),
                !matches!(container.health_status, view::HealthStatus::Unhealthy),
            );
        }

        let mut has_rollback_containers = false;

        for container in &ordered {
            if is_rollback_container_name(&container.name) {
                if self.is_rollback_in_progress(container) {
                    has_rollback_containers = true;
                } else {
                    match self.engine.remove(&container.id, true).await {
                        Ok(()) => info!("removed stale rollback leftover {}", container.name),
                        Err(error) => warn!("failed to remove stale rollback leftover {}: {error}", container.name),
                    }
                }
                continue;
            }

            if self.dependencies_blocked(container, &running_by_base, &healthy_by_base) {
                debug!("{} skipped: dependency not ready", container.name);
                continue;
            }

            if !self.try_mark_in_flight(&container.base_name).await {
                debug!("{} skipped: cooldown or already in flight", container.base_name);
                continue;
            }

            self.process_container(container, &mut event_log).await;
            self.clear_in_flight(&container.base_name).await;
        }

        if prune_due && !has_rollback_containers {
            prune::run(self, &mut event_log).await;
        } else if prune_due {
            info!("prune due but rollback containers present; skipping this tick");
            if self.notifier.category_enabled(NotificationCategory::Prune) {
                event_log.push("prune skipped: rollback-in-progress container still present".to_string());
            }
        }

        self.notifier.flush(&event_log).await;
        self.notifier.flush_detections(&detect_log).await;

        self.persist_state().await;

        Ok(())
    }

    /// A rollback-marker container blocks prune while it's still running or
    /// younger than `rollback_grace_seconds` (§4.6.8); once both conditions
    /// clear it's a stale leftover, not a rollback in progress.
    fn is_rollback_in_progress(&self, container: &ContainerSnapshot) -> bool {
        if container.running {
            return true;
        }
        let grace = ChronoDuration::seconds(self.settings.rollback_grace_seconds as i64);
        container.started_at.is_none_or(|started_at| Utc::now().signed_duration_since(started_at) < grace)
    }

    fn schedule_label_filters(&self) -> Vec<String> {
        vec![
            self.settings.update_label.clone(),
            self.settings.restart_label.clone(),
            self.settings.recreate_label.clone(),
            self.settings.health_label.clone(),
        ]
    }

    fn dependencies_blocked(
        &self,
        container: &ContainerSnapshot,
        running_by_base: &HashMap<String, bool>,
        healthy_by_base: &HashMap<String, bool>,
    ) -> bool {
        container.depends_on.iter().any(|dependency| {
            let running = running_by_base.get(dependency).copied().unwrap_or(false);
            let healthy = healthy_by_base.get(dependency).copied().unwrap_or(true);
            !running || !healthy
        })
    }

    async fn track_known_containers(&self, containers: &[ContainerSnapshot], detect_log: &mut Vec<String>) {
        let mut state = self.state.lock().await;
        for container in containers {
            if state.guerite_created.remove(&container.id) {
                continue;
            }
            if !state.known.container_ids.contains(&container.id) && !state.known.container_names.contains(&container.base_name) {
                detect_log.push(format!("detected new container {}", container.name));
            }
            state.known.container_ids.insert(container.id.clone());
            state.known.container_names.insert(container.base_name.clone());
        }
    }

    /// Attempts to acquire the per-`base_name` cooldown and in-flight marker.
    /// Returns false if either blocks this tick.
    async fn try_mark_in_flight(&self, base_name: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.in_flight.contains(base_name) {
            return false;
        }
        if let Some(last) = state.last_action.get(base_name) {
            let elapsed = Utc::now().signed_duration_since(*last);
            if elapsed < ChronoDuration::seconds(self.settings.action_cooldown_seconds as i64) {
                return false;
            }
        }
        state.in_flight.insert(base_name.to_string());
        true
    }

    async fn clear_in_flight(&self, base_name: &str) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(base_name);
    }

    async fn record_action(&self, base_name: &str) {
        let mut state = self.state.lock().await;
        state.last_action.insert(base_name.to_string(), Utc::now());
    }

    fn due_action(&self, container: &ContainerSnapshot) -> Option<DueAction> {
        let now = Utc::now();
        let update_due = container
            .label(&self.settings.update_label)
            .is_some_and(|expr| crate::clock::matches(expr, now, &format!("{}:update", container.id)));
        let recreate_due = container
            .label(&self.settings.recreate_label)
            .is_some_and(|expr| crate::clock::matches(expr, now, &format!("{}:recreate", container.id)));
        let restart_due = container
            .label(&self.settings.restart_label)
            .is_some_and(|expr| crate::clock::matches(expr, now, &format!("{}:restart", container.id)));
        let health_due = container
            .label(&self.settings.health_label)
            .is_some_and(|expr| crate::clock::matches(expr, now, &format!("{}:health", container.id)));

        // §4.6.2 priority: update (new digest) > recreate (scheduled) > restart (scheduled) > health.
        if update_due {
            return Some(DueAction::Update);
        }
        if recreate_due {
            return Some(DueAction::Recreate);
        }
        if restart_due {
            return Some(DueAction::Restart);
        }
        if health_due && matches!(container.health_status, view::HealthStatus::Unhealthy) {
            return Some(DueAction::Health);
        }
        None
    }

    async fn process_container(&self, container: &ContainerSnapshot, event_log: &mut Vec<String>) {
        if container.platform_managed {
            debug!("{} skipped: platform managed", container.name);
            return;
        }

        let Some(due) = self.due_action(container) else { return };

        if due == DueAction::Health {
            if !container.has_healthcheck {
                warn!("{} has no healthcheck; suppressing health slot", container.name);
                return;
            }
            let mut state = self.state.lock().await;
            if let Some(backoff_until) = state.health_backoff.get(&container.id) {
                if *backoff_until > Utc::now() {
                    debug!("{} still in health back-off window", container.name);
                    return;
                }
            }
            drop(state);
        }

        if self.settings.dry_run {
            info!("dry run: would perform {:?} on {}", due, container.name);
            event_log.push(format!("[dry-run] {:?} due for {}", due, container.name));
            return;
        }

        if self.settings.lifecycle_hooks_enabled {
            hooks::run_pre_check(self, container, event_log).await;
        }

        let post_check_id = match due {
            DueAction::Update => self.handle_update(container, event_log).await,
            DueAction::Recreate => self.handle_recreate(container, false, false, None, event_log).await,
            DueAction::Restart => self.handle_restart(container, event_log).await,
            DueAction::Health => self.handle_recreate(container, false, true, None, event_log).await,
        };

        if self.settings.lifecycle_hooks_enabled {
            hooks::run_post_check(self, &post_check_id, container, event_log).await;
        }

        self.record_action(&container.base_name).await;
    }

    /// Returns the container id this action leaves in place, so a following
    /// `post_check` hook targets the right container (a recreate may have
    /// replaced the original id with a new one).
    async fn handle_update(&self, container: &ContainerSnapshot, event_log: &mut Vec<String>) -> String {
        if self.settings.no_pull || container.label_bool(view::NO_PULL_LABEL) {
            debug!("{} update due but no_pull is set; skipping pull", container.name);
            return container.id.clone();
        }
        match self.engine.pull(&container.image_ref).await {
            Ok(pulled) if pulled.id == container.image_id => {
                info!("{} is already up to date", container.name);
                container.id.clone()
            }
            Ok(pulled) => {
                info!("{} has a new image digest; recreating", container.name);
                self.handle_recreate(container, true, false, Some(pulled.id), event_log).await
            }
            Err(error) => {
                warn!("failed to pull {} for {}: {error}", container.image_ref, container.name);
                if self.notifier.category_enabled(NotificationCategory::Update) {
                    event_log.push(format!("pull failed for {}: {error}", container.name));
                }
                container.id.clone()
            }
        }
    }

    async fn handle_restart(&self, container: &ContainerSnapshot, event_log: &mut Vec<String>) -> String {
        if self.settings.no_restart || container.label_bool(view::NO_RESTART_LABEL) {
            info!("{} restart due but no_restart is set", container.name);
            return container.id.clone();
        }
        if self.settings.monitor_only || container.label_bool(view::MONITOR_ONLY_LABEL) {
            event_log.push(format!("monitor-only: would restart {}", container.name));
            return container.id.clone();
        }
        if let Some(backoff_until) = self.state.lock().await.restart_backoff.get(&container.id).copied() {
            if backoff_until > Utc::now() {
                debug!("{} still in restart back-off", container.name);
                return container.id.clone();
            }
        }

        match self.engine.restart(&container.id, Some(self.settings.stop_timeout_seconds as i64)).await {
            Ok(()) => {
                self.clear_restart_backoff(&container.id).await;
                info!("restarted {}", container.name);
                if self.notifier.category_enabled(NotificationCategory::Restart) {
                    event_log.push(format!("restarted {}", container.name));
                }
            }
            Err(error) => {
                warn!("failed to restart {}: {error}", container.name);
                self.register_restart_failure(&container.id).await;
                if self.notifier.category_enabled(NotificationCategory::Restart) {
                    event_log.push(format!("restart failed for {}: {error}", container.name));
                }
            }
        }
        container.id.clone()
    }

    async fn handle_recreate(
        &self,
        container: &ContainerSnapshot,
        is_upgrade: bool,
        health_triggered: bool,
        pulled_image_id: Option<String>,
        event_log: &mut Vec<String>,
    ) -> String {
        if self.settings.no_restart || container.label_bool(view::NO_RESTART_LABEL) {
            info!("{} recreate due but no_restart is set", container.name);
            return container.id.clone();
        }
        if self.settings.monitor_only || container.label_bool(view::MONITOR_ONLY_LABEL) {
            event_log.push(format!("monitor-only: would recreate {}", container.name));
            return container.id.clone();
        }

        if self.settings.lifecycle_hooks_enabled && is_upgrade {
            if !hooks::run_pre_update(self, container, event_log).await {
                return container.id.clone();
            }
        }

        if is_upgrade {
            let mut state = self.state.lock().await;
            state.upgrade.insert(
                container.id.clone(),
                crate::state::UpgradeEntry {
                    original_image_id: container.image_id.clone(),
                    target_image_id: pulled_image_id.clone().unwrap_or_default(),
                    base_name: container.base_name.clone(),
                    started_at: Utc::now(),
                    status: crate::state::UpgradeStatus::InProgress,
                    notified: false,
                },
            );
        }

        let outcome = recreate::recreate(self, container, is_upgrade, pulled_image_id.as_deref()).await;

        match outcome {
            RecreateOutcome::Success { new_id } => {
                self.clear_restart_backoff(&container.id).await;
                if health_triggered {
                    let mut state = self.state.lock().await;
                    state.health_backoff.insert(
                        new_id.clone(),
                        Utc::now() + ChronoDuration::seconds(self.settings.health_backoff_seconds as i64),
                    );
                    let snapshot = state.health_backoff.clone();
                    drop(state);
                    let _ = self.state_store.save_health(&snapshot).await;
                }
                if is_upgrade {
                    let mut state = self.state.lock().await;
                    if let Some(entry) = state.upgrade.get_mut(&container.id) {
                        entry.status = crate::state::UpgradeStatus::Completed;
                    }
                    drop(state);
                    if let Err(error) = self.engine.remove_image(&container.image_id).await {
                        warn!("failed to remove old image {}: {error}", container.image_id);
                        if self.notifier.category_enabled(NotificationCategory::Update) {
                            event_log.push(format!("failed to remove old image for {}: {error}", container.name));
                        }
                    }
                }
                info!("recreated {} successfully", container.name);
                let category = if is_upgrade { NotificationCategory::Update } else { NotificationCategory::Recreate };
                if self.notifier.category_enabled(category) {
                    event_log.push(format!("recreated {}", container.name));
                }
                self.metrics.incr_containers_updated();

                if self.settings.lifecycle_hooks_enabled && is_upgrade {
                    hooks::run_post_update(self, &new_id, container, event_log).await;
                }
                new_id
            }
            RecreateOutcome::RolledBack { reason } => {
                warn!("recreate of {} rolled back: {reason}", container.name);
                self.register_restart_failure(&container.id).await;
                if is_upgrade {
                    let mut state = self.state.lock().await;
                    if let Some(entry) = state.upgrade.get_mut(&container.id) {
                        entry.status = crate::state::UpgradeStatus::Failed;
                    }
                }
                self.metrics.incr_containers_failed();
                let category = if is_upgrade { NotificationCategory::Update } else { NotificationCategory::Recreate };
                if self.notifier.category_enabled(category) {
                    event_log.push(format!("recreate of {} rolled back: {reason}", container.name));
                }
                container.id.clone()
            }
        }
    }

    async fn register_restart_failure(&self, id: &str) {
        let mut state = self.state.lock().await;
        let count = state.fail_count.entry(id.to_string()).or_insert(0);
        *count += 1;
        let fail_count = *count;
        let base_delay = self.settings.health_backoff_seconds.saturating_mul(fail_count.max(1) as u64);
        let mut delay = base_delay.min(3600);
        if fail_count >= self.settings.restart_retry_limit {
            delay = delay.max(self.settings.health_backoff_seconds.saturating_mul(self.settings.restart_retry_limit as u64));
        }
        state.restart_backoff.insert(id.to_string(), Utc::now() + ChronoDuration::seconds(delay as i64));
    }

    async fn clear_restart_backoff(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.fail_count.remove(id);
        state.restart_backoff.remove(id);
    }

    async fn persist_state(&self) {
        let (upgrade, known) = {
            let state = self.state.lock().await;
            (state.upgrade.clone(), state.known.clone())
        };
        if let Err(error) = self.state_store.save_upgrade(&upgrade).await {
            warn!("failed to persist upgrade state: {error}");
        }
        if let Err(error) = self.state_store.save_known(&known).await {
            warn!("failed to persist known-container state: {error}");
        }
    }
}
