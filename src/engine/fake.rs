use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::view::{ContainerSnapshot, HealthStatus, MountPoint, NetworkEndpoint};

use super::{ContainerEngine, CreateSpec, EngineError, EngineEvent, PulledImage};

/// Named failure points the test harness can arm before driving an action.
/// Each variant corresponds to one transition in the recreate state machine
/// (§4.6.6), so rollback paths can be exercised deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Create,
    Stop,
    Connect,
    Start,
    HealthTimeout,
    Rename,
    Remove,
    Pull,
    Exec,
    PruneImages,
}

struct Inner {
    containers: HashMap<String, ContainerSnapshot>,
    images: HashMap<String, String>,
    next_id: u64,
    armed_failures: HashSet<FailurePoint>,
    events: Vec<EngineEvent>,
    exec_calls: Vec<(String, String)>,
}

/// In-memory `ContainerEngine` for exercising the action engine, scheduler,
/// and the recreate state machine's rollback paths without a real daemon.
pub struct FakeEngine {
    inner: Mutex<Inner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                containers: HashMap::new(),
                images: HashMap::new(),
                next_id: 1,
                armed_failures: HashSet::new(),
                events: Vec::new(),
                exec_calls: Vec::new(),
            }),
        }
    }

    /// `(container_id, command)` pairs passed to `exec`, in call order.
    pub fn exec_calls(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.exec_calls.clone()
    }

    pub fn seed(&self, container: ContainerSnapshot) {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.containers.insert(container.id.clone(), container);
    }

    pub fn set_image_digest(&self, image_ref: &str, digest: &str) {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.images.insert(image_ref.to_string(), digest.to_string());
    }

    pub fn arm_failure(&self, point: FailurePoint) {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.armed_failures.insert(point);
    }

    pub fn container(&self, id: &str) -> Option<ContainerSnapshot> {
        let inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.containers.get(id).cloned()
    }

    pub fn container_by_name(&self, name: &str) -> Option<ContainerSnapshot> {
        let inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.containers.values().find(|c| c.name == name).cloned()
    }

    fn fail(inner: &Inner, point: FailurePoint) -> bool {
        inner.armed_failures.contains(&point)
    }

    fn next_id(inner: &mut Inner) -> String {
        let id = format!("{:064x}", inner.next_id);
        inner.next_id += 1;
        id
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerSnapshot>, EngineError> {
        let inner = self.inner.lock().expect("fake engine mutex poisoned");
        Ok(inner
            .containers
            .values()
            .filter(|c| label_filters.iter().any(|l| c.labels.contains_key(l)))
            .cloned()
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot, EngineError> {
        let inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Inspect { id: id.to_string(), source: "not found".to_string() })
    }

    async fn pull(&self, image_ref: &str) -> Result<PulledImage, EngineError> {
        let inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Pull) {
            return Err(EngineError::Pull { image_ref: image_ref.to_string(), source: "armed failure".to_string() });
        }
        let id = inner.images.get(image_ref).cloned().unwrap_or_else(|| format!("sha256:{image_ref}"));
        Ok(PulledImage { id })
    }

    async fn create(&self, spec: CreateSpec) -> Result<String, EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Create) {
            return Err(EngineError::Create { name: spec.name.clone(), source: "armed failure".to_string() });
        }
        let id = Self::next_id(&mut inner);
        let image_id = inner.images.get(&spec.image_ref).cloned().unwrap_or_else(|| format!("sha256:{}", spec.image_ref));
        let snapshot = ContainerSnapshot {
            id: id.clone(),
            base_name: crate::view::base_name(&spec.name),
            compose_project: spec.labels.get(crate::view::COMPOSE_PROJECT_LABEL).cloned(),
            image_id,
            image_ref: spec.image_ref.clone(),
            labels: spec.labels.clone(),
            running: false,
            health_status: if spec.healthcheck_test.is_some() { HealthStatus::Starting } else { HealthStatus::None },
            started_at: None,
            has_healthcheck: spec.healthcheck_test.is_some(),
            healthcheck_test: spec.healthcheck_test.clone(),
            host_config: crate::view::HostConfig {
                command: spec.command.clone(),
                entrypoint: spec.entrypoint.clone(),
                env: spec.env.clone(),
                hostname: spec.hostname.clone(),
                domainname: spec.domainname.clone(),
                user: spec.user.clone(),
                working_dir: spec.working_dir.clone(),
                binds: spec.binds.clone(),
                exposed_ports: spec.exposed_ports.clone(),
                stop_signal: spec.stop_signal.clone(),
                stop_timeout: spec.stop_timeout,
                tty: spec.tty,
                stdin_open: spec.stdin_open,
                mac_address: spec.mac_address.clone(),
                runtime: spec.runtime.clone(),
                shell: spec.shell.clone(),
                network_disabled: spec.network_disabled,
            },
            mounts: Vec::new(),
            networks: spec.networks.clone(),
            platform_managed: crate::view::is_platform_managed(&spec.labels),
            depends_on: Vec::new(),
            name: spec.name.clone(),
        };
        inner.containers.insert(id.clone(), snapshot);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Start) {
            return Err(EngineError::Start { id: id.to_string(), source: "armed failure".to_string() });
        }
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(EngineError::Start { id: id.to_string(), source: "not found".to_string() }),
        }
    }

    async fn stop(&self, id: &str, _timeout_secs: Option<i64>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Stop) {
            return Err(EngineError::Stop { id: id.to_string(), source: "armed failure".to_string() });
        }
        if let Some(c) = inner.containers.get_mut(id) {
            c.running = false;
        }
        Ok(())
    }

    async fn restart(&self, id: &str, _timeout_secs: Option<i64>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Start) {
            return Err(EngineError::Restart { id: id.to_string(), source: "armed failure".to_string() });
        }
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(EngineError::Restart { id: id.to_string(), source: "not found".to_string() }),
        }
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Rename) {
            return Err(EngineError::Rename { id: id.to_string(), new_name: new_name.to_string(), source: "armed failure".to_string() });
        }
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.name = new_name.to_string();
                c.base_name = crate::view::base_name(new_name);
                Ok(())
            }
            None => Err(EngineError::Rename { id: id.to_string(), new_name: new_name.to_string(), source: "not found".to_string() }),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Remove) {
            return Err(EngineError::Remove { id: id.to_string(), source: "armed failure".to_string() });
        }
        if !force {
            if let Some(c) = inner.containers.get(id) {
                if c.running {
                    return Err(EngineError::Remove { id: id.to_string(), source: "container is running".to_string() });
                }
            }
        }
        inner.containers.remove(id);
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.images.retain(|_, v| v != id);
        Ok(())
    }

    async fn connect(&self, id: &str, network: &str, endpoint: &NetworkEndpoint) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::Connect) {
            return Err(EngineError::Connect { id: id.to_string(), network: network.to_string(), source: "armed failure".to_string() });
        }
        if let Some(c) = inner.containers.get_mut(id) {
            c.networks.push(endpoint.clone());
        }
        Ok(())
    }

    async fn disconnect(&self, id: &str, network: &str, _force: bool) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        if let Some(c) = inner.containers.get_mut(id) {
            c.networks.retain(|n| n.name != network);
        }
        Ok(())
    }

    async fn prune_images(&self, _timeout_secs: u64) -> Result<Vec<String>, EngineError> {
        let inner = self.inner.lock().expect("fake engine mutex poisoned");
        if Self::fail(&inner, FailurePoint::PruneImages) {
            return Err(EngineError::PruneImages("armed failure".to_string()));
        }
        Ok(Vec::new())
    }

    async fn exec(&self, id: &str, command: &str, _timeout_secs: u64) -> Result<i64, EngineError> {
        let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
        inner.exec_calls.push((id.to_string(), command.to_string()));
        if Self::fail(&inner, FailurePoint::Exec) {
            return Err(EngineError::Exec { id: id.to_string(), source: "armed failure".to_string() });
        }
        Ok(0)
    }

    async fn mounts(&self, id: &str) -> Result<Vec<MountPoint>, EngineError> {
        Ok(self.inspect(id).await?.mounts)
    }

    async fn stream_events(&self, on_event: &mut (dyn FnMut(EngineEvent) + Send)) -> Result<(), EngineError> {
        let events = {
            let mut inner = self.inner.lock().expect("fake engine mutex poisoned");
            std::mem::take(&mut inner.events)
        };
        for event in events {
            on_event(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample(id: &str, name: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            id: id.to_string(),
            name: name.to_string(),
            base_name: crate::view::base_name(name),
            compose_project: None,
            image_id: "sha256:old".to_string(),
            image_ref: "demo:latest".to_string(),
            labels: HashMap::new(),
            running: true,
            health_status: HealthStatus::None,
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

    #[tokio::test]
    async fn create_assigns_a_fresh_id() {
        let engine = FakeEngine::new();
        engine.seed(sample("c1", "web"));
        let spec = CreateSpec { name: "web-guerite-new-deadbeef".to_string(), image_ref: "demo:latest".to_string(), ..Default::default() };
        let new_id = engine.create(spec).await.unwrap();
        assert_ne!(new_id, "c1");
        assert!(engine.container(&new_id).is_some());
    }

    #[tokio::test]
    async fn armed_failure_surfaces_on_the_targeted_call() {
        let engine = FakeEngine::new();
        engine.seed(sample("c1", "web"));
        engine.arm_failure(FailurePoint::Stop);
        assert!(engine.stop("c1", None).await.is_err());
        assert!(engine.start("c1").await.is_ok());
    }
}
