use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeEntry {
    pub original_image_id: String,
    pub target_image_id: String,
    pub base_name: String,
    pub started_at: DateTime<Utc>,
    pub status: UpgradeStatus,
    #[serde(default)]
    pub notified: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnownContainers {
    #[serde(default)]
    pub container_ids: HashSet<String>,
    #[serde(default)]
    pub container_names: HashSet<String>,
}

pub type HealthBackoffMap = HashMap<String, DateTime<Utc>>;
pub type UpgradeMap = HashMap<String, UpgradeEntry>;

/// Atomic JSON persistence of the three state maps. All mutations are
/// serialized through one store-wide mutex so concurrent ticks (there is
/// only ever one, but event-listener-triggered reconciliation can overlap
/// with a tick in flight) never interleave a read with a write.
pub struct StateStore {
    health_path: PathBuf,
    upgrade_path: PathBuf,
    known_path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(state_file: &str, upgrade_file: &str, known_file: &str) -> Self {
        Self {
            health_path: PathBuf::from(state_file),
            upgrade_path: PathBuf::from(upgrade_file),
            known_path: PathBuf::from(known_file),
            lock: Mutex::new(()),
        }
    }

    pub async fn load_health(&self) -> HealthBackoffMap {
        let _guard = self.lock.lock().await;
        load_json(&self.health_path).unwrap_or_default()
    }

    pub async fn save_health(&self, map: &HealthBackoffMap) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        save_json(&self.health_path, map)
    }

    pub async fn load_upgrade(&self) -> UpgradeMap {
        let _guard = self.lock.lock().await;
        load_json(&self.upgrade_path).unwrap_or_default()
    }

    pub async fn save_upgrade(&self, map: &UpgradeMap) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        save_json(&self.upgrade_path, map)
    }

    pub async fn load_known(&self) -> KnownContainers {
        let _guard = self.lock.lock().await;
        load_json(&self.known_path).unwrap_or_default()
    }

    pub async fn save_known(&self, known: &KnownContainers) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        save_json(&self.known_path, known)
    }
}

fn load_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => {
            warn!("failed to read state file {}: {error}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!("malformed state file {}: {error}; starting from empty state", path.display());
            None
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let serialized = serde_json::to_vec_pretty(value).map_err(StateError::Serialize)?;
    let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
    std::fs::write(&tmp_path, &serialized).map_err(|source| StateError::Write {
        path: tmp_path.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StateError::Rename {
        from: tmp_path.display().to_string(),
        to: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_paths(tag: &str) -> (String, String, String) {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        (
            dir.join(format!("guerite_test_{tag}_{pid}_health.json")).display().to_string(),
            dir.join(format!("guerite_test_{tag}_{pid}_upgrade.json")).display().to_string(),
            dir.join(format!("guerite_test_{tag}_{pid}_known.json")).display().to_string(),
        )
    }

    #[tokio::test]
    async fn missing_file_yields_empty_state() {
        let (h, u, k) = temp_paths("missing");
        let store = StateStore::new(&h, &u, &k);
        assert!(store.load_health().await.is_empty());
        assert!(store.load_upgrade().await.is_empty());
        assert!(store.load_known().await.container_ids.is_empty());
    }

    #[tokio::test]
    async fn round_trips_health_backoff() {
        let (h, u, k) = temp_paths("roundtrip");
        let store = StateStore::new(&h, &u, &k);
        let mut map: HealthBackoffMap = HashMap::new();
        map.insert("abc123".to_string(), Utc::now());
        store.save_health(&map).await.unwrap();
        let loaded = store.load_health().await;
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("abc123"));
        let _ = std::fs::remove_file(&h);
        let _ = std::fs::remove_file(&u);
        let _ = std::fs::remove_file(&k);
    }

    #[tokio::test]
    async fn malformed_file_yields_empty_state() {
        let (h, u, k) = temp_paths("malformed");
        std::fs::write(&h, b"not json").unwrap();
        let store = StateStore::new(&h, &u, &k);
        assert!(store.load_health().await.is_empty());
        let _ = std::fs::remove_file(&h);
        let _ = std::fs::remove_file(&u);
        let _ = std::fs::remove_file(&k);
    }
}
