use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{ListImagesOptions, PruneImagesOptions};
use bollard::models::{EndpointSettings, HealthConfig, HostConfig, Mount as BollardMount};
use bollard::network::{ConnectNetworkOptions, DisconnectNetworkOptions};
use bollard::system::EventsOptions;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::view::{ContainerSnapshot, HealthStatus, HostConfig as HostConfigSnapshot, MountPoint, NetworkEndpoint};

use super::{ContainerEngine, CreateSpec, EngineError, EngineEvent, PulledImage};

/// Real engine client, backed by the local Docker/Moby socket.
pub struct BollardEngine {
    client: Docker,
    docker_host: String,
}

impl BollardEngine {
    pub fn connect(docker_host: &str) -> Result<Self, bollard::errors::Error> {
        let client = if docker_host.starts_with("unix://") {
            Docker::connect_with_unix(docker_host, 120, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_http(docker_host, 120, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { client, docker_host: docker_host.to_string() })
    }

    /// A client connected with a longer read timeout, used only around the
    /// prune call (§4.6.8), which can legitimately run long. The original
    /// client is untouched; the caller drops this one when done.
    pub fn reconnect_with_timeout(&self, docker_host: &str, timeout_secs: u64) -> Result<Self, bollard::errors::Error> {
        let client = if docker_host.starts_with("unix://") {
            Docker::connect_with_unix(docker_host, timeout_secs, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_http(docker_host, timeout_secs, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { client, docker_host: docker_host.to_string() })
    }
}

#[allow(clippy::too_many_arguments)]
fn to_snapshot(
    id: String,
    name: String,
    image_id: String,
    image_ref: String,
    labels: HashMap<String, String>,
    running: bool,
    health_status: HealthStatus,
    started_at: Option<DateTime<Utc>>,
    has_healthcheck: bool,
    healthcheck_test: Option<Vec<String>>,
    host_config: HostConfigSnapshot,
    mounts: Vec<MountPoint>,
    networks: Vec<NetworkEndpoint>,
) -> ContainerSnapshot {
    let platform_managed = crate::view::is_platform_managed(&labels);
    ContainerSnapshot {
        base_name: crate::view::base_name(&name),
        compose_project: labels.get(crate::view::COMPOSE_PROJECT_LABEL).cloned(),
        depends_on: Vec::new(),
        id,
        name,
        image_id,
        image_ref,
        labels,
        running,
        health_status,
        started_at,
        has_healthcheck,
        healthcheck_test,
        host_config,
        mounts,
        networks,
        platform_managed,
    }
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerSnapshot>, EngineError> {
        let mut seen: HashMap<String, ContainerSnapshot> = HashMap::new();
        for label in label_filters {
            let mut filters = HashMap::new();
            filters.insert("label".to_string(), vec![label.clone()]);
            let summaries = self
                .client
                .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
                .await
                .map_err(|e| EngineError::List(e.to_string()))?;
            for summary in summaries {
                let Some(id) = summary.id.clone() else { continue };
                if seen.contains_key(&id) {
                    continue;
                }
                match self.inspect(&id).await {
                    Ok(snapshot) => {
                        seen.insert(id, snapshot);
                    }
                    Err(error) => warn!("failed to inspect {id} during list: {error}"),
                }
            }
        }
        Ok(seen.into_values().collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot, EngineError> {
        let details = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| EngineError::Inspect { id: id.to_string(), source: e.to_string() })?;

        let name = details.name.unwrap_or_else(|| id.to_string()).trim_start_matches('/').to_string();
        let config = details.config.unwrap_or_default();
        let labels = config.labels.unwrap_or_default();
        let image_ref = config.image.unwrap_or_default();
        let state = details.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        let health_status = HealthStatus::from_docker_str(
            state.health.and_then(|h| h.status).map(|s| s.to_string()).as_deref(),
        );
        let healthcheck_test = config
            .healthcheck
            .as_ref()
            .and_then(|h: &HealthConfig| h.test.clone())
            .filter(|t| !t.is_empty());
        let has_healthcheck = healthcheck_test.is_some();

        let started_at = state.started_at.as_deref().and_then(|raw| {
            DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).ok()
        });

        let host_config_details = details.host_config.unwrap_or_default();
        let host_config = HostConfigSnapshot {
            command: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            env: config.env.clone().unwrap_or_default(),
            hostname: config.hostname.clone(),
            domainname: config.domainname.clone(),
            user: config.user.clone(),
            working_dir: config.working_dir.clone(),
            binds: host_config_details.binds.clone().unwrap_or_default(),
            exposed_ports: config.exposed_ports.clone().map(|p| p.into_keys().collect()).unwrap_or_default(),
            stop_signal: config.stop_signal.clone(),
            stop_timeout: config.stop_timeout,
            tty: config.tty.unwrap_or(false),
            stdin_open: config.open_stdin.unwrap_or(false),
            mac_address: config.mac_address.clone(),
            runtime: host_config_details.runtime.clone(),
            shell: config.shell.clone(),
            network_disabled: config.network_disabled,
        };

        let mounts = details
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m: BollardMount| MountPoint {
                mount_type: m.typ.map(|t| format!("{t:?}").to_lowercase()).unwrap_or_default(),
                name: m.name,
                source: m.source,
                destination: m.destination.unwrap_or_default(),
                driver: m.driver,
            })
            .collect();

        let networks = details
            .network_settings
            .and_then(|ns| ns.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, settings): (String, EndpointSettings)| NetworkEndpoint {
                name,
                aliases: settings.aliases.unwrap_or_default(),
                links: settings.links.unwrap_or_default(),
                ipv4_address: settings.ip_address,
                ipv6_address: settings.global_ipv6_address,
                link_local_ips: settings
                    .ipam_config
                    .as_ref()
                    .and_then(|c| c.link_local_i_ps.clone())
                    .unwrap_or_default(),
                driver_opts: settings.driver_opts.unwrap_or_default(),
                mac_address: settings.mac_address,
                gateway_priority: None,
            })
            .collect();

        Ok(to_snapshot(
            id.to_string(),
            name,
            details.image.unwrap_or_default(),
            image_ref,
            labels,
            running,
            health_status,
            started_at,
            has_healthcheck,
            healthcheck_test,
            host_config,
            mounts,
            networks,
        ))
    }

    async fn pull(&self, image_ref: &str) -> Result<PulledImage, EngineError> {
        let options = bollard::image::CreateImageOptions { from_image: image_ref, ..Default::default() };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Err(error) = progress {
                return Err(EngineError::Pull { image_ref: image_ref.to_string(), source: error.to_string() });
            }
        }
        let details = self
            .client
            .inspect_image(image_ref)
            .await
            .map_err(|e| EngineError::Pull { image_ref: image_ref.to_string(), source: e.to_string() })?;
        Ok(PulledImage { id: details.id.unwrap_or_default() })
    }

    async fn create(&self, spec: CreateSpec) -> Result<String, EngineError> {
        let mut endpoints_config = HashMap::new();
        for network in &spec.networks {
            endpoints_config.insert(
                network.name.clone(),
                EndpointSettings {
                    aliases: Some(network.aliases.clone()),
                    links: Some(network.links.clone()),
                    ip_address: network.ipv4_address.clone(),
                    global_ipv6_address: network.ipv6_address.clone(),
                    driver_opts: Some(network.driver_opts.clone()),
                    mac_address: network.mac_address.clone(),
                    ..Default::default()
                },
            );
        }

        let exposed_ports = spec
            .exposed_ports
            .iter()
            .map(|p| (p.clone(), HashMap::new()))
            .collect::<HashMap<_, _>>();

        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            runtime: spec.runtime.clone(),
            ..Default::default()
        };

        let healthcheck = spec.healthcheck_test.clone().map(|test| HealthConfig {
            test: Some(test),
            ..Default::default()
        });

        let config = ContainerConfig {
            image: Some(spec.image_ref.clone()),
            cmd: spec.command.clone(),
            entrypoint: spec.entrypoint.clone(),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            hostname: spec.hostname.clone(),
            domainname: spec.domainname.clone(),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            exposed_ports: Some(exposed_ports),
            stop_signal: spec.stop_signal.clone(),
            stop_timeout: spec.stop_timeout,
            tty: Some(spec.tty),
            open_stdin: Some(spec.stdin_open),
            mac_address: spec.mac_address.clone(),
            shell: spec.shell.clone(),
            host_config: Some(host_config),
            networking_config: Some(bollard::models::NetworkingConfig {
                endpoints_config: Some(endpoints_config),
            }),
            network_disabled: spec.network_disabled,
            healthcheck,
            ..Default::default()
        };

        let options = CreateContainerOptions { name: spec.name.clone(), platform: None };
        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| EngineError::Create { name: spec.name.clone(), source: e.to_string() })?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(|e| EngineError::Start { id: id.to_string(), source: e.to_string() })
    }

    async fn stop(&self, id: &str, timeout_secs: Option<i64>) -> Result<(), EngineError> {
        let options = timeout_secs.map(|t| StopContainerOptions { t });
        self.client
            .stop_container(id, options)
            .await
            .map_err(|e| EngineError::Stop { id: id.to_string(), source: e.to_string() })
    }

    async fn restart(&self, id: &str, timeout_secs: Option<i64>) -> Result<(), EngineError> {
        let options = timeout_secs.map(|t| bollard::container::RestartContainerOptions { t });
        self.client
            .restart_container(id, options)
            .await
            .map_err(|e| EngineError::Restart { id: id.to_string(), source: e.to_string() })
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<(), EngineError> {
        let options = bollard::container::RenameContainerOptions { name: new_name };
        self.client
            .rename_container(id, options)
            .await
            .map_err(|e| EngineError::Rename { id: id.to_string(), new_name: new_name.to_string(), source: e.to_string() })
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions { force, ..Default::default() };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| EngineError::Remove { id: id.to_string(), source: e.to_string() })
    }

    async fn remove_image(&self, id: &str) -> Result<(), EngineError> {
        self.client
            .remove_image(id, None, None)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::RemoveImage { id: id.to_string(), source: e.to_string() })
    }

    async fn connect(&self, id: &str, network: &str, endpoint: &NetworkEndpoint) -> Result<(), EngineError> {
        let config = EndpointSettings {
            aliases: Some(endpoint.aliases.clone()),
            links: Some(endpoint.links.clone()),
            ip_address: endpoint.ipv4_address.clone(),
            global_ipv6_address: endpoint.ipv6_address.clone(),
            driver_opts: Some(endpoint.driver_opts.clone()),
            mac_address: endpoint.mac_address.clone(),
            ..Default::default()
        };
        let options = ConnectNetworkOptions { container: id.to_string(), endpoint_config: config };
        self.client
            .connect_network(network, options)
            .await
            .map_err(|e| EngineError::Connect { id: id.to_string(), network: network.to_string(), source: e.to_string() })
    }

    async fn disconnect(&self, id: &str, network: &str, force: bool) -> Result<(), EngineError> {
        let options = DisconnectNetworkOptions { container: id.to_string(), force };
        self.client
            .disconnect_network(network, options)
            .await
            .map_err(|e| EngineError::Disconnect { id: id.to_string(), network: network.to_string(), source: e.to_string() })
    }

    async fn prune_images(&self, timeout_secs: u64) -> Result<Vec<String>, EngineError> {
        // Raised-timeout client is transient: it is dropped at the end of this
        // call, so the long-lived client's timeout is never mutated.
        let raised = timeout_secs.max(180);
        let prune_client = self
            .reconnect_with_timeout(&self.docker_host, raised)
            .map_err(|e| EngineError::PruneImages(e.to_string()))?;

        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["false".to_string()]);
        let response = prune_client
            .client
            .prune_images(Some(PruneImagesOptions { filters }))
            .await
            .map_err(|e| EngineError::PruneImages(e.to_string()))?;
        let mut removed = Vec::new();
        for entry in response.images_deleted.unwrap_or_default() {
            if let Some(deleted) = entry.deleted {
                removed.push(deleted);
            } else if let Some(untagged) = entry.untagged {
                removed.push(untagged);
            }
        }
        let _ = ListImagesOptions::<String>::default();
        Ok(removed)
    }

    async fn exec(&self, id: &str, command: &str, timeout_secs: u64) -> Result<i64, EngineError> {
        let exec = self
            .client
            .create_exec(id, CreateExecOptions {
                cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::Exec { id: id.to_string(), source: e.to_string() })?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::Exec { id: id.to_string(), source: e.to_string() })?;

        if let StartExecResults::Attached { mut output, .. } = started {
            let drain = async {
                while (tokio::time::timeout(Duration::from_secs(timeout_secs), output.next()).await).is_ok() {
                    // drain until the stream ends or the timeout fires.
                }
            };
            drain.await;
        }

        let inspected = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EngineError::Exec { id: id.to_string(), source: e.to_string() })?;
        Ok(inspected.exit_code.unwrap_or(-1))
    }

    async fn mounts(&self, id: &str) -> Result<Vec<MountPoint>, EngineError> {
        Ok(self.inspect(id).await?.mounts)
    }

    async fn stream_events(&self, on_event: &mut (dyn FnMut(EngineEvent) + Send)) -> Result<(), EngineError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let mut stream = self.client.events(Some(EventsOptions::<String> { filters, ..Default::default() }));
        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| EngineError::Events(e.to_string()))?;
            let kind = event.typ.map(|t| format!("{t:?}").to_lowercase()).unwrap_or_default();
            let action = event.action.unwrap_or_default();
            let labels = event.actor.and_then(|actor| actor.attributes).unwrap_or_default();
            let display_name = labels
                .get("name")
                .or_else(|| labels.get("container"))
                .or_else(|| labels.get("com.docker.compose.service"))
                .cloned();
            debug!("engine event {kind}/{action} name={display_name:?}");
            on_event(EngineEvent { kind, action, display_name, labels });
        }
        Ok(())
    }
}
