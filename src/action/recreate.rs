use std::time::Duration;

use tracing::{error, warn};

use crate::engine::{ContainerEngine, CreateSpec, EngineError};
use crate::view::{ContainerSnapshot, HealthStatus};

use super::ActionEngine;

pub enum RecreateOutcome {
    Success { new_id: String },
    RolledBack { reason: String },
}

/// Builds the `CreateSpec` for the replacement container from the source
/// snapshot, per the configuration-cloning contract (§4.6.6.1). Networks are
/// carried in full; only the first is attached at create time, the rest are
/// connected explicitly in S3→S4 (Docker's create call only honors one
/// endpoint config entry reliably).
fn clone_config(source: &ContainerSnapshot, name: &str, image_ref: &str) -> CreateSpec {
    let host_config = &source.host_config;
    CreateSpec {
        name: name.to_string(),
        image_ref: image_ref.to_string(),
        command: host_config.command.clone(),
        entrypoint: host_config.entrypoint.clone(),
        env: host_config.env.clone(),
        labels: source.labels.clone(),
        hostname: host_config.hostname.clone(),
        domainname: host_config.domainname.clone(),
        user: host_config.user.clone(),
        working_dir: host_config.working_dir.clone(),
        binds: host_config.binds.clone(),
        exposed_ports: host_config.exposed_ports.clone(),
        stop_signal: host_config.stop_signal.clone(),
        stop_timeout: host_config.stop_timeout,
        tty: host_config.tty,
        stdin_open: host_config.stdin_open,
        healthcheck_test: source.healthcheck_test.clone(),
        mac_address: host_config.mac_address.clone(),
        runtime: host_config.runtime.clone(),
        shell: host_config.shell.clone(),
        network_disabled: host_config.network_disabled,
        networks: source.networks.iter().take(1).cloned().collect(),
    }
}

/// Runs the blue/green recreate state machine (§4.6.6). On any failure after
/// S0, rolls back per the fixed sequence in §4.6.6 so the production name is
/// always freed before the old container is renamed back.
pub async fn recreate<E: ContainerEngine>(
    actor: &ActionEngine<E>,
    container: &ContainerSnapshot,
    is_upgrade: bool,
    pulled_image_id: Option<&str>,
) -> RecreateOutcome {
    let engine = actor.engine.as_ref();
    let base = container.base_name.clone();
    let suffix = &container.id[..container.id.len().min(8)];
    let temp_old = format!("{base}-guerite-old-{suffix}");
    let temp_new = format!("{base}-guerite-new-{suffix}");
    // The image reference (tag) is unchanged across an upgrade; only the
    // digest it resolves to differs, which `pull` already applied engine-side.
    let image_ref = container.image_ref.clone();
    let _ = (is_upgrade, pulled_image_id);

    preflight_warn_mounts(actor, container).await;

    // S0 -> S1
    if let Err(error) = engine.rename(&container.id, &temp_old).await {
        return rollback(actor, container, &base, None, false, format!("rename to {temp_old} failed: {error}")).await;
    }

    // S1 -> S2
    let spec = clone_config(container, &temp_new, &image_ref);
    let new_id = match engine.create(spec).await {
        Ok(id) => id,
        Err(error) => {
            return rollback(actor, container, &base, None, true, format!("create {temp_new} failed: {error}")).await;
        }
    };

    // S2 -> S3: stopping the old container is best-effort.
    if let Err(error) = engine.stop(&container.id, Some(actor.settings.stop_timeout_seconds as i64)).await {
        warn!("stop of old container {} failed (continuing): {error}", container.id);
    }

    // S3 -> S4: attach any additional networks the source carried.
    let mut attached_networks: Vec<String> = Vec::new();
    for network in container.networks.iter().skip(1) {
        if let Err(error) = engine.connect(&new_id, &network.name, network).await {
            for already in &attached_networks {
                let _ = engine.disconnect(&new_id, already, true).await;
            }
            return rollback(
                actor,
                container,
                &base,
                Some(new_id),
                true,
                format!("connect {} to {} failed: {error}", new_id, network.name),
            )
            .await;
        }
        attached_networks.push(network.name.clone());
    }

    // S4 -> S5
    if let Err(error) = engine.start(&new_id).await {
        return rollback(actor, container, &base, Some(new_id), true, format!("start of {new_id} failed: {error}")).await;
    }

    // S5 -> S6: health-gated verification, only if the source had a healthcheck.
    if container.has_healthcheck {
        if let Err(reason) = wait_for_healthy(actor, &new_id).await {
            return rollback(actor, container, &base, Some(new_id), true, reason).await;
        }
    }

    // S6 -> S7
    if let Err(error) = engine.rename(&new_id, &base).await {
        return rollback(actor, container, &base, Some(new_id), true, format!("promote rename failed: {error}")).await;
    }
    {
        let mut state = actor.state.lock().await;
        state.guerite_created.insert(new_id.clone());
    }

    // S7 -> S8: removing the old container is best-effort; prune will catch stragglers.
    if let Err(error) = engine.remove(&container.id, false).await {
        warn!("failed to remove old container {} after promote: {error}", container.id);
    }

    RecreateOutcome::Success { new_id }
}

async fn preflight_warn_mounts<E: ContainerEngine>(actor: &ActionEngine<E>, container: &ContainerSnapshot) {
    for mount in &container.mounts {
        if let Some(source) = &mount.source {
            if mount.mount_type == "bind" && !std::path::Path::new(source).exists() {
                warn!("bind source {source} for {} does not exist here", container.name);
            }
        }
        if let Some(driver) = &mount.driver {
            if driver != "local" {
                warn!("volume {:?} for {} uses non-local driver {driver}", mount.name, container.name);
            }
        }
    }
    let _ = actor;
}

async fn wait_for_healthy<E: ContainerEngine>(actor: &ActionEngine<E>, id: &str) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(actor.settings.health_check_timeout_seconds);
    loop {
        match actor.engine.inspect(id).await {
            Ok(snapshot) => match snapshot.health_status {
                HealthStatus::Healthy | HealthStatus::None => return Ok(()),
                HealthStatus::Starting => {}
                HealthStatus::Unhealthy | HealthStatus::Other => {
                    return Err(format!("health check for {id} reported {:?}", snapshot.health_status));
                }
            },
            Err(error) => return Err(format!("failed to inspect {id} during health wait: {error}")),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("health check for {id} timed out"));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Fixed rollback sequence (§4.6.6): free the production name before the old
/// container is renamed back, regardless of which transition failed.
async fn rollback<E: ContainerEngine>(
    actor: &ActionEngine<E>,
    container: &ContainerSnapshot,
    base: &str,
    new_id: Option<String>,
    old_was_renamed: bool,
    reason: String,
) -> RecreateOutcome {
    let engine = actor.engine.as_ref();

    if let Some(new_id) = &new_id {
        match remove_new_container(engine, new_id, base).await {
            Ok(()) => {}
            Err(error) => {
                error!("rollback failed to remove new container {new_id} for {base}: {error}");
            }
        }
    }

    if old_was_renamed {
        if let Err(error) = engine.rename(&container.id, base).await {
            error!("rollback failed to rename old container {} back to {base}: {error}", container.id);
        }
        if let Err(error) = engine.start(&container.id).await {
            warn!("rollback restart of old container {} failed (non-fatal): {error}", container.id);
        }
    }

    RecreateOutcome::RolledBack { reason }
}

async fn remove_new_container<E: ContainerEngine>(engine: &E, new_id: &str, base: &str) -> Result<(), EngineError> {
    if engine.remove(new_id, true).await.is_ok() {
        return Ok(());
    }
    let suffix = &new_id[..new_id.len().min(8)];
    let failed_name = format!("{base}-guerite-failed-{suffix}");
    engine.rename(new_id, &failed_name).await?;
    engine.remove(new_id, true).await
}
