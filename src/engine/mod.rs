pub mod bollard_engine;
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::view::{ContainerSnapshot, MountPoint, NetworkEndpoint};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to list containers: {0}")]
    List(String),
    #[error("failed to inspect container {id}: {source}")]
    Inspect { id: String, source: String },
    #[error("failed to pull image {image_ref}: {source}")]
    Pull { image_ref: String, source: String },
    #[error("failed to create container {name}: {source}")]
    Create { name: String, source: String },
    #[error("failed to start container {id}: {source}")]
    Start { id: String, source: String },
    #[error("failed to stop container {id}: {source}")]
    Stop { id: String, source: String },
    #[error("failed to restart container {id}: {source}")]
    Restart { id: String, source: String },
    #[error("failed to rename container {id} to {new_name}: {source}")]
    Rename { id: String, new_name: String, source: String },
    #[error("failed to remove container {id}: {source}")]
    Remove { id: String, source: String },
    #[error("failed to remove image {id}: {source}")]
    RemoveImage { id: String, source: String },
    #[error("failed to connect {id} to network {network}: {source}")]
    Connect { id: String, network: String, source: String },
    #[error("failed to disconnect {id} from network {network}: {source}")]
    Disconnect { id: String, network: String, source: String },
    #[error("failed to prune images: {0}")]
    PruneImages(String),
    #[error("failed to exec in container {id}: {source}")]
    Exec { id: String, source: String },
    #[error("event stream error: {0}")]
    Events(String),
}

#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image_ref: String,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub binds: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<i64>,
    pub tty: bool,
    pub stdin_open: bool,
    pub healthcheck_test: Option<Vec<String>>,
    pub mac_address: Option<String>,
    pub runtime: Option<String>,
    pub shell: Option<Vec<String>>,
    pub network_disabled: Option<bool>,
    pub networks: Vec<NetworkEndpoint>,
}

#[derive(Debug, Clone)]
pub struct PulledImage {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub kind: String,
    pub action: String,
    pub display_name: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Narrow interface to the local container engine. The blue/green recreate
/// state machine, the update decision, and prune all speak only to this
/// trait, so they can be exercised against `fake::FakeEngine` without a real
/// daemon.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerSnapshot>, EngineError>;
    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot, EngineError>;
    async fn pull(&self, image_ref: &str) -> Result<PulledImage, EngineError>;
    async fn create(&self, spec: CreateSpec) -> Result<String, EngineError>;
    async fn start(&self, id: &str) -> Result<(), EngineError>;
    async fn stop(&self, id: &str, timeout_secs: Option<i64>) -> Result<(), EngineError>;
    async fn restart(&self, id: &str, timeout_secs: Option<i64>) -> Result<(), EngineError>;
    async fn rename(&self, id: &str, new_name: &str) -> Result<(), EngineError>;
    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError>;
    async fn remove_image(&self, id: &str) -> Result<(), EngineError>;
    async fn connect(&self, id: &str, network: &str, endpoint: &NetworkEndpoint) -> Result<(), EngineError>;
    async fn disconnect(&self, id: &str, network: &str, force: bool) -> Result<(), EngineError>;
    async fn prune_images(&self, timeout_secs: u64) -> Result<Vec<String>, EngineError>;
    async fn exec(&self, id: &str, command: &str, timeout_secs: u64) -> Result<i64, EngineError>;
    async fn mounts(&self, id: &str) -> Result<Vec<MountPoint>, EngineError>;

    /// Consumes the engine's event stream, calling `on_event` for every
    /// container event until the stream ends or errors.
    async fn stream_events(&self, on_event: &mut (dyn FnMut(EngineEvent) + Send)) -> Result<(), EngineError>;
}
