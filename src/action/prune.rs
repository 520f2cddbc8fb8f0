use tracing::{info, warn};

use crate::engine::ContainerEngine;
use crate::notifications::NotificationCategory;

use super::ActionEngine;

/// Runs the scheduled prune (§4.6.8). The caller has already confirmed no
/// rollback-marker container (`-guerite-old-`/`-guerite-new-`) is still
/// running or within `rollback_grace_seconds`, force-removing any stale
/// leftovers before reaching this point.
pub async fn run<E: ContainerEngine>(actor: &ActionEngine<E>, event_log: &mut Vec<String>) {
    match actor.engine.prune_images(actor.settings.prune_timeout_seconds).await {
        Ok(removed) => {
            info!("pruned {} dangling image(s)", removed.len());
            if !removed.is_empty() && actor.notifier.category_enabled(NotificationCategory::Prune) {
                event_log.push(format!("pruned {} dangling image(s)", removed.len()));
            }
        }
        Err(error) => {
            warn!("image prune failed: {error}");
            if actor.notifier.category_enabled(NotificationCategory::Prune) {
                event_log.push(format!("image prune failed: {error}"));
            }
        }
    }
}
