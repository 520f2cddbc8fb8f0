use tracing::{info, warn};

use crate::engine::ContainerEngine;
use crate::notifications::NotificationCategory;
use crate::view::{self, ContainerSnapshot};

use super::ActionEngine;

const BENIGN_EXIT_CODE: i64 = 75;

/// Runs `guerite.lifecycle.pre_check`, if the container carries one, ahead of
/// the whole action decision for this tick. Never aborts the decision itself.
pub async fn run_pre_check<E: ContainerEngine>(
    actor: &ActionEngine<E>,
    container: &ContainerSnapshot,
    event_log: &mut Vec<String>,
) {
    let Some(hook) = container.label(view::PRE_CHECK_LABEL).map(str::to_string) else { return };
    run_hook(actor, container, &container.id, "pre_check", &hook, actor.settings.hook_timeout_seconds, event_log).await;
}

/// Runs `guerite.lifecycle.post_check` against whatever container id is
/// current after the action decision (a recreate may have replaced it).
pub async fn run_post_check<E: ContainerEngine>(
    actor: &ActionEngine<E>,
    current_id: &str,
    container: &ContainerSnapshot,
    event_log: &mut Vec<String>,
) {
    let Some(hook) = container.label(view::POST_CHECK_LABEL).map(str::to_string) else { return };
    run_hook(actor, container, current_id, "post_check", &hook, actor.settings.hook_timeout_seconds, event_log).await;
}

/// Runs `guerite.lifecycle.pre_update`, if the container carries one.
pub async fn run_pre_update<E: ContainerEngine>(
    actor: &ActionEngine<E>,
    container: &ContainerSnapshot,
    event_log: &mut Vec<String>,
) -> bool {
    let Some(hook) = container.label(view::PRE_UPDATE_LABEL).map(str::to_string) else { return true };
    let timeout = container.label_u64(view::PRE_UPDATE_TIMEOUT_LABEL).unwrap_or(actor.settings.hook_timeout_seconds);
    run_hook(actor, container, &container.id, "pre_update", &hook, timeout, event_log).await
}

/// Runs `guerite.lifecycle.post_update` against the newly promoted container.
pub async fn run_post_update<E: ContainerEngine>(
    actor: &ActionEngine<E>,
    new_id: &str,
    container: &ContainerSnapshot,
    event_log: &mut Vec<String>,
) {
    let Some(hook) = container.label(view::POST_UPDATE_LABEL).map(str::to_string) else { return };
    let timeout = container.label_u64(view::POST_UPDATE_TIMEOUT_LABEL).unwrap_or(actor.settings.hook_timeout_seconds);
    run_hook(actor, container, new_id, "post_update", &hook, timeout, event_log).await;
}

/// Runs one lifecycle hook command against `id`. A nonzero exit (other than
/// the benign 75) or an exec error is logged and notified but never aborts
/// the caller's action.
async fn run_hook<E: ContainerEngine>(
    actor: &ActionEngine<E>,
    container: &ContainerSnapshot,
    id: &str,
    slot: &str,
    command: &str,
    timeout_secs: u64,
    event_log: &mut Vec<String>,
) -> bool {
    match actor.engine.exec(id, command, timeout_secs).await {
        Ok(code) if code == 0 || code == BENIGN_EXIT_CODE => {
            info!("{slot} hook for {} exited {code}", container.name);
            true
        }
        Ok(code) => {
            warn!("{slot} hook for {} exited {code}; continuing", container.name);
            if actor.notifier.category_enabled(NotificationCategory::Update) {
                event_log.push(format!("{slot} hook for {} exited {code}", container.name));
            }
            true
        }
        Err(error) => {
            warn!("{slot} hook for {} failed: {error}; continuing", container.name);
            if actor.notifier.category_enabled(NotificationCategory::Update) {
                event_log.push(format!("{slot} hook for {} failed: {error}", container.name));
            }
            true
        }
    }
}
