use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::engine::ContainerEngine;
use crate::notifications::NotificationCategory;
use crate::state::UpgradeStatus;
use crate::view::ContainerSnapshot;

use super::ActionEngine;

/// Falls back to a by-name lookup when the stored id is gone: the operator
/// may have recreated the container under the same name with a new id.
async fn find_by_base_name<E: ContainerEngine>(actor: &ActionEngine<E>, base_name: &str) -> Option<ContainerSnapshot> {
    let containers = actor.engine.list(&[]).await.ok()?;
    containers.into_iter().find(|c| c.base_name == base_name)
}

/// Reconciles stalled and failed upgrade entries at the top of a tick
/// (§4.6.7). Stale `in-progress` entries are marked failed; `failed` entries
/// are checked for manual resolution (operator already fixed the container)
/// and, failing that, surfaced as a one-time notification.
pub async fn reconcile<E: ContainerEngine>(actor: &ActionEngine<E>, event_log: &mut Vec<String>) {
    let stall_timeout = ChronoDuration::seconds(actor.settings.upgrade_stall_timeout_seconds as i64);
    let mut to_clear = Vec::new();
    let mut to_notify: Vec<(String, String)> = Vec::new();

    {
        let mut state = actor.state.lock().await;
        let now = Utc::now();

        for (id, entry) in state.upgrade.iter_mut() {
            if entry.status == UpgradeStatus::InProgress && now.signed_duration_since(entry.started_at) > stall_timeout {
                warn!("upgrade of {} (id {id}) stalled; marking failed", entry.base_name);
                entry.status = UpgradeStatus::Failed;
            }
        }

        let ids: Vec<String> = state.upgrade.keys().cloned().collect();
        for id in ids {
            let entry = state.upgrade.get(&id).cloned();
            let current = match actor.engine.inspect(&id).await {
                Ok(snapshot) => Some(snapshot),
                Err(_) => match &entry {
                    Some(entry) => find_by_base_name(actor, &entry.base_name).await,
                    None => None,
                },
            };
            let Some(entry) = entry else { continue };
            if entry.status != UpgradeStatus::Failed {
                continue;
            }

            match current {
                Some(snapshot) if snapshot.image_id != entry.original_image_id => {
                    info!("upgrade of {} appears manually resolved; clearing", entry.base_name);
                    state.fail_count.remove(&id);
                    state.restart_backoff.remove(&id);
                    to_clear.push(id.clone());
                }
                Some(_) => {
                    if !entry.notified {
                        to_notify.push((id.clone(), entry.base_name.clone()));
                        if let Some(e) = state.upgrade.get_mut(&id) {
                            e.notified = true;
                        }
                    }
                }
                None => {
                    if !entry.notified {
                        to_notify.push((id.clone(), entry.base_name.clone()));
                    }
                    to_clear.push(id.clone());
                }
            }
        }

        for id in &to_clear {
            state.upgrade.remove(id);
        }
    }

    for (_, base_name) in &to_notify {
        if actor.notifier.category_enabled(NotificationCategory::Update) {
            event_log.push(format!("upgrade of {base_name} requires manual intervention"));
        }
    }
}
