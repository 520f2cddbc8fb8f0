use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Settings;

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.id";
pub const PLATFORM_MANAGED_LABELS: &[&str] = &[SWARM_SERVICE_LABEL];

pub const MONITOR_ONLY_LABEL: &str = "guerite.monitor_only";
pub const NO_PULL_LABEL: &str = "guerite.no_pull";
pub const NO_RESTART_LABEL: &str = "guerite.no_restart";
pub const PRE_CHECK_LABEL: &str = "guerite.lifecycle.pre_check";
pub const PRE_UPDATE_LABEL: &str = "guerite.lifecycle.pre_update";
pub const POST_UPDATE_LABEL: &str = "guerite.lifecycle.post_update";
pub const POST_CHECK_LABEL: &str = "guerite.lifecycle.post_check";
pub const PRE_UPDATE_TIMEOUT_LABEL: &str = "guerite.lifecycle.pre_update_timeout_seconds";
pub const POST_UPDATE_TIMEOUT_LABEL: &str = "guerite.lifecycle.post_update_timeout_seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    None,
    Starting,
    Healthy,
    Unhealthy,
    Other,
}

impl HealthStatus {
    pub fn from_docker_str(value: Option<&str>) -> Self {
        match value.map(|v| v.to_lowercase()) {
            None => HealthStatus::None,
            Some(v) if v == "starting" => HealthStatus::Starting,
            Some(v) if v == "healthy" => HealthStatus::Healthy,
            Some(v) if v == "unhealthy" => HealthStatus::Unhealthy,
            Some(_) => HealthStatus::Other,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub name: String,
    pub aliases: Vec<String>,
    pub links: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub link_local_ips: Vec<String>,
    pub driver_opts: HashMap<String, String>,
    pub mac_address: Option<String>,
    pub gateway_priority: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountPoint {
    pub mount_type: String,
    pub name: Option<String>,
    pub source: Option<String>,
    pub destination: String,
    pub driver: Option<String>,
}

/// The engine-level container-config fields the recreate state machine needs
/// to clone onto the replacement container (§4.6.6.1): everything `create`
/// accepts beyond the name, image, labels, and networks already carried as
/// their own `ContainerSnapshot` fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
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
    pub mac_address: Option<String>,
    pub runtime: Option<String>,
    pub shell: Option<Vec<String>>,
    pub network_disabled: Option<bool>,
}

/// An immutable record of one container as observed this tick.
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub base_name: String,
    pub compose_project: Option<String>,
    pub image_id: String,
    pub image_ref: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub health_status: HealthStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub has_healthcheck: bool,
    pub healthcheck_test: Option<Vec<String>>,
    pub host_config: HostConfig,
    pub mounts: Vec<MountPoint>,
    pub networks: Vec<NetworkEndpoint>,
    pub platform_managed: bool,
    pub depends_on: Vec<String>,
}

impl ContainerSnapshot {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|v| v.as_str())
    }

    /// Parses a label as a boolean the same way the settings loader parses
    /// its own `GUERITE_*` env booleans. Absent means "not overridden".
    pub fn label_bool(&self, key: &str) -> bool {
        self.label(key).is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    pub fn label_u64(&self, key: &str) -> Option<u64> {
        self.label(key).and_then(|v| v.trim().parse().ok())
    }
}

static SUFFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)-guerite-(?:old|new)-[0-9a-f]{8}$").expect("valid literal regex"));

/// Strips any trailing `-guerite-old-<8hex>` / `-guerite-new-<8hex>` suffix,
/// repeating until the string is stable.
pub fn base_name(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        match SUFFIX_PATTERN.captures(&current) {
            Some(captures) => current = captures[1].to_string(),
            None => return current,
        }
    }
}

/// Selects the containers carrying any schedule label, applying scope and
/// include/exclude filters, and derives dependency edges.
pub fn select(all: Vec<ContainerSnapshot>, settings: &Settings) -> Vec<ContainerSnapshot> {
    all.into_iter()
        .filter(|c| has_any_schedule_label(c, settings))
        .filter(|c| matches_scope(c, settings))
        .filter(|c| passes_name_filters(c, settings))
        .collect()
}

fn has_any_schedule_label(container: &ContainerSnapshot, settings: &Settings) -> bool {
    [
        &settings.update_label,
        &settings.restart_label,
        &settings.recreate_label,
        &settings.health_label,
    ]
    .iter()
    .any(|label| container.labels.contains_key(label.as_str()))
}

fn matches_scope(container: &ContainerSnapshot, settings: &Settings) -> bool {
    match &settings.scope_value {
        None => true,
        Some(expected) => container.label(&settings.scope_label) == Some(expected.as_str()),
    }
}

fn passes_name_filters(container: &ContainerSnapshot, settings: &Settings) -> bool {
    if !settings.include_names.is_empty() && !settings.include_names.contains(&container.base_name) {
        return false;
    }
    if settings.exclude_names.contains(&container.base_name) {
        return false;
    }
    true
}

/// Parses a container's `depends_label` value (comma-separated container
/// names) into normalized base names.
pub fn parse_depends_label(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(base_name)
        .collect()
}

pub fn is_platform_managed(labels: &HashMap<String, String>) -> bool {
    PLATFORM_MANAGED_LABELS.iter().any(|key| labels.contains_key(*key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_single_suffix() {
        assert_eq!(base_name("web-guerite-old-1a2b3c4d"), "web");
        assert_eq!(base_name("web-guerite-new-deadbeef"), "web");
    }

    #[test]
    fn base_name_is_idempotent_under_repeated_suffixing() {
        let stacked = "web-guerite-old-aaaaaaaa-guerite-new-bbbbbbbb";
        let once = base_name(stacked);
        assert_eq!(base_name(&once), once);
        assert_eq!(once, "web");
    }

    #[test]
    fn base_name_leaves_unsuffixed_names_untouched() {
        assert_eq!(base_name("web"), "web");
        assert_eq!(base_name("my-app-service"), "my-app-service");
    }

    #[test]
    fn depends_label_normalizes_to_base_names() {
        let parsed = parse_depends_label("db, cache-guerite-old-01234567,  ");
        assert_eq!(parsed, vec!["db".to_string(), "cache".to_string()]);
    }

    #[test]
    fn platform_managed_detects_swarm_label() {
        let mut labels = HashMap::new();
        labels.insert(SWARM_SERVICE_LABEL.to_string(), "abc".to_string());
        assert!(is_platform_managed(&labels));
        assert!(!is_platform_managed(&HashMap::new()));
    }
}
