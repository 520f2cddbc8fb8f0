use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::action::ActionEngine;
use crate::config::Settings;
use crate::engine::{ContainerEngine, EngineEvent};
use crate::view;

const MONITORED_ACTIONS: &[&str] =
    &["create", "destroy", "die", "kill", "pause", "rename", "restart", "start", "stop", "unpause", "update"];

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Consumes the engine's event stream and wakes the main loop when a
/// monitored label's container changes outside of our own action cooldown
/// (§4.7). Runs for the lifetime of the process as a `tokio::spawn`ed task.
pub async fn run<E, F>(make_engine: F, settings: Settings, wake: Arc<Notify>, action_engine: Arc<ActionEngine<E>>)
where
    E: ContainerEngine + 'static,
    F: Fn() -> E,
{
    let schedule_labels =
        [settings.update_label.clone(), settings.restart_label.clone(), settings.recreate_label.clone(), settings.health_label.clone()];
    let mut backoff = RECONNECT_INITIAL_BACKOFF;

    loop {
        let engine = make_engine();
        info!("event listener connected");
        backoff = RECONNECT_INITIAL_BACKOFF;

        let mut handler = |event: EngineEvent| {
            if event.kind != "container" || !MONITORED_ACTIONS.contains(&event.action.as_str()) {
                return;
            }
            let Some(display_name) = event.display_name.clone() else { return };
            let base = view::base_name(&display_name);

            if !schedule_labels.iter().any(|label| event.labels.contains_key(label)) {
                debug!("event for {base} suppressed: no schedule label present");
                return;
            }

            let in_cooldown = action_engine.state.try_lock().map(|state| {
                state
                    .last_action
                    .get(&base)
                    .is_some_and(|last| chrono::Utc::now().signed_duration_since(*last) < chrono::Duration::seconds(settings.action_cooldown_seconds as i64))
            }).unwrap_or(false);

            if in_cooldown {
                debug!("event for {base} suppressed: within our own action cooldown");
                return;
            }

            debug!("event listener waking main loop for {base}");
            wake.notify_one();
        };

        match engine.stream_events(&mut handler).await {
            Ok(()) => warn!("event stream ended; reconnecting"),
            Err(error) => warn!("event stream error: {error}; reconnecting in {backoff:?}"),
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
    }
}
