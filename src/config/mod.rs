use std::collections::HashSet;
use std::env;

use tracing::warn;

pub const DEFAULT_UPDATE_LABEL: &str = "guerite.update";
pub const DEFAULT_RESTART_LABEL: &str = "guerite.restart";
pub const DEFAULT_RECREATE_LABEL: &str = "guerite.recreate";
pub const DEFAULT_HEALTH_LABEL: &str = "guerite.health_check";
pub const DEFAULT_DEPENDS_LABEL: &str = "guerite.depends_on";
pub const DEFAULT_SCOPE_LABEL: &str = "guerite.scope";

pub const DEFAULT_DOCKER_HOST: &str = "unix://var/run/docker.sock";
pub const DEFAULT_PUSHOVER_API: &str = "https://api.pushover.net/1/messages.json";
pub const DEFAULT_STATE_FILE: &str = "/tmp/guerite_state.json";
pub const DEFAULT_TZ: &str = "UTC";
pub const DEFAULT_NOTIFICATIONS: &str = "update";

pub const DEFAULT_HEALTH_BACKOFF_SECONDS: u64 = 300;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_PRUNE_TIMEOUT_SECONDS: u64 = 180;
pub const DEFAULT_ROLLBACK_GRACE_SECONDS: u64 = 3600;
pub const DEFAULT_ACTION_COOLDOWN_SECONDS: u64 = 60;
pub const DEFAULT_UPGRADE_STALL_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_DOCKER_CONNECT_BACKOFF_SECONDS: u64 = 5;
pub const DEFAULT_NOTIFICATION_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_STOP_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_HOOK_TIMEOUT_SECONDS: u64 = 30;

pub const DEFAULT_RESTART_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_DOCKER_CONNECT_RETRIES: u32 = 5;

pub const DEFAULT_HTTP_API_HOST: &str = "0.0.0.0";
pub const DEFAULT_HTTP_API_PORT: u16 = 8088;

pub const ALL_NOTIFICATION_EVENTS: &[&str] = &[
    "update", "restart", "recreate", "health", "startup", "detect", "prune",
];

/// Frozen runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub docker_host: String,
    pub update_label: String,
    pub restart_label: String,
    pub recreate_label: String,
    pub health_label: String,
    pub depends_label: String,
    pub scope_label: String,
    pub scope_value: Option<String>,
    pub include_names: HashSet<String>,
    pub exclude_names: HashSet<String>,

    pub health_backoff_seconds: u64,
    pub health_check_timeout_seconds: u64,
    pub prune_timeout_seconds: u64,
    pub rollback_grace_seconds: u64,
    pub action_cooldown_seconds: u64,
    pub upgrade_stall_timeout_seconds: u64,
    pub docker_connect_backoff_seconds: u64,
    pub notification_timeout_seconds: u64,
    pub stop_timeout_seconds: u64,
    pub hook_timeout_seconds: u64,

    pub restart_retry_limit: u32,
    pub docker_connect_retries: u32,

    pub dry_run: bool,
    pub monitor_only: bool,
    pub no_pull: bool,
    pub no_restart: bool,
    pub rolling_restart: bool,
    pub lifecycle_hooks_enabled: bool,
    pub run_once: bool,
    pub http_api_enabled: bool,
    pub http_api_metrics: bool,

    pub notifications: HashSet<String>,

    pub pushover_token: Option<String>,
    pub pushover_user: Option<String>,
    pub pushover_api: String,
    pub webhook_url: Option<String>,

    pub state_file: String,
    pub prune_cron: Option<String>,
    pub timezone: String,
    pub hostname: String,

    pub http_api_host: String,
    pub http_api_port: u16,
    pub http_api_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            update_label: DEFAULT_UPDATE_LABEL.to_string(),
            restart_label: DEFAULT_RESTART_LABEL.to_string(),
            recreate_label: DEFAULT_RECREATE_LABEL.to_string(),
            health_label: DEFAULT_HEALTH_LABEL.to_string(),
            depends_label: DEFAULT_DEPENDS_LABEL.to_string(),
            scope_label: DEFAULT_SCOPE_LABEL.to_string(),
            scope_value: None,
            include_names: HashSet::new(),
            exclude_names: HashSet::new(),

            health_backoff_seconds: DEFAULT_HEALTH_BACKOFF_SECONDS,
            health_check_timeout_seconds: DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS,
            prune_timeout_seconds: DEFAULT_PRUNE_TIMEOUT_SECONDS,
            rollback_grace_seconds: DEFAULT_ROLLBACK_GRACE_SECONDS,
            action_cooldown_seconds: DEFAULT_ACTION_COOLDOWN_SECONDS,
            upgrade_stall_timeout_seconds: DEFAULT_UPGRADE_STALL_TIMEOUT_SECONDS,
            docker_connect_backoff_seconds: DEFAULT_DOCKER_CONNECT_BACKOFF_SECONDS,
            notification_timeout_seconds: DEFAULT_NOTIFICATION_TIMEOUT_SECONDS,
            stop_timeout_seconds: DEFAULT_STOP_TIMEOUT_SECONDS,
            hook_timeout_seconds: DEFAULT_HOOK_TIMEOUT_SECONDS,

            restart_retry_limit: DEFAULT_RESTART_RETRY_LIMIT,
            docker_connect_retries: DEFAULT_DOCKER_CONNECT_RETRIES,

            dry_run: false,
            monitor_only: false,
            no_pull: false,
            no_restart: false,
            rolling_restart: false,
            lifecycle_hooks_enabled: false,
            run_once: false,
            http_api_enabled: false,
            http_api_metrics: false,

            notifications: [DEFAULT_NOTIFICATIONS.to_string()].into_iter().collect(),

            pushover_token: None,
            pushover_user: None,
            pushover_api: DEFAULT_PUSHOVER_API.to_string(),
            webhook_url: None,

            state_file: DEFAULT_STATE_FILE.to_string(),
            prune_cron: None,
            timezone: DEFAULT_TZ.to_string(),
            hostname: "localhost".to_string(),

            http_api_host: DEFAULT_HTTP_API_HOST.to_string(),
            http_api_port: DEFAULT_HTTP_API_PORT,
            http_api_token: None,
        }
    }
}

impl Settings {
    /// Load settings from the environment, substituting defaults for anything
    /// missing or unparsable. Never fails: a typo in one variable should not
    /// prevent the process from starting.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            docker_host: env::var("DOCKER_HOST").unwrap_or(defaults.docker_host),
            update_label: env_str("GUERITE_UPDATE_LABEL", &defaults.update_label),
            restart_label: env_str("GUERITE_RESTART_LABEL", &defaults.restart_label),
            recreate_label: env_str("GUERITE_RECREATE_LABEL", &defaults.recreate_label),
            health_label: env_str("GUERITE_HEALTH_CHECK_LABEL", &defaults.health_label),
            depends_label: env_str("GUERITE_DEPENDS_LABEL", &defaults.depends_label),
            scope_label: env_str("GUERITE_SCOPE_LABEL", &defaults.scope_label),
            scope_value: env_str_optional("GUERITE_SCOPE_VALUE", None),
            include_names: env_csv_set_raw("GUERITE_INCLUDE_NAMES"),
            exclude_names: env_csv_set_raw("GUERITE_EXCLUDE_NAMES"),

            health_backoff_seconds: env_u64(
                "GUERITE_HEALTH_CHECK_BACKOFF_SECONDS",
                defaults.health_backoff_seconds,
            ),
            health_check_timeout_seconds: env_u64(
                "GUERITE_HEALTH_CHECK_TIMEOUT_SECONDS",
                defaults.health_check_timeout_seconds,
            ),
            prune_timeout_seconds: env_u64_optional(
                "GUERITE_PRUNE_TIMEOUT_SECONDS",
                defaults.prune_timeout_seconds,
            ),
            rollback_grace_seconds: env_u64(
                "GUERITE_ROLLBACK_GRACE_SECONDS",
                defaults.rollback_grace_seconds,
            ),
            action_cooldown_seconds: env_u64(
                "GUERITE_ACTION_COOLDOWN_SECONDS",
                defaults.action_cooldown_seconds,
            ),
            upgrade_stall_timeout_seconds: env_u64(
                "GUERITE_UPGRADE_STALL_TIMEOUT_SECONDS",
                defaults.upgrade_stall_timeout_seconds,
            ),
            docker_connect_backoff_seconds: env_u64(
                "GUERITE_DOCKER_CONNECT_BACKOFF_SECONDS",
                defaults.docker_connect_backoff_seconds,
            ),
            notification_timeout_seconds: env_u64(
                "GUERITE_NOTIFICATION_TIMEOUT_SECONDS",
                defaults.notification_timeout_seconds,
            ),
            stop_timeout_seconds: env_u64("GUERITE_STOP_TIMEOUT_SECONDS", defaults.stop_timeout_seconds),
            hook_timeout_seconds: env_u64("GUERITE_HOOK_TIMEOUT_SECONDS", defaults.hook_timeout_seconds),

            restart_retry_limit: env_u32("GUERITE_RESTART_RETRY_LIMIT", defaults.restart_retry_limit),
            docker_connect_retries: env_u32(
                "GUERITE_DOCKER_CONNECT_RETRIES",
                defaults.docker_connect_retries,
            ),

            dry_run: env_bool("GUERITE_DRY_RUN", defaults.dry_run),
            monitor_only: env_bool("GUERITE_MONITOR_ONLY", defaults.monitor_only),
            no_pull: env_bool("GUERITE_NO_PULL", defaults.no_pull),
            no_restart: env_bool("GUERITE_NO_RESTART", defaults.no_restart),
            rolling_restart: env_bool("GUERITE_ROLLING_RESTART", defaults.rolling_restart),
            lifecycle_hooks_enabled: env_bool(
                "GUERITE_LIFECYCLE_HOOKS_ENABLED",
                defaults.lifecycle_hooks_enabled,
            ),
            run_once: env_bool("GUERITE_RUN_ONCE", defaults.run_once),
            http_api_enabled: env_bool("GUERITE_HTTP_API_ENABLED", defaults.http_api_enabled),
            http_api_metrics: env_bool("GUERITE_HTTP_API_METRICS", defaults.http_api_metrics),

            notifications: env_notification_set("GUERITE_NOTIFICATIONS"),

            pushover_token: env_str_optional("GUERITE_PUSHOVER_TOKEN", None),
            pushover_user: env_str_optional("GUERITE_PUSHOVER_USER", None),
            pushover_api: env_str("GUERITE_PUSHOVER_API", &defaults.pushover_api),
            webhook_url: env_str_optional("GUERITE_WEBHOOK_URL", defaults.webhook_url.clone()),

            state_file: env_str("GUERITE_STATE_FILE", &defaults.state_file),
            prune_cron: env_str_optional("GUERITE_PRUNE_CRON", defaults.prune_cron.clone()),
            timezone: env_str("GUERITE_TZ", &defaults.timezone),
            hostname: hostname(),

            http_api_host: env_str("GUERITE_HTTP_API_HOST", &defaults.http_api_host),
            http_api_port: env_u16("GUERITE_HTTP_API_PORT", defaults.http_api_port),
            http_api_token: env_str_optional("GUERITE_HTTP_API_TOKEN", None),
        }
    }

    /// Path to the upgrade-state file, derived from `state_file`.
    pub fn upgrade_state_path(&self) -> String {
        sibling_path(&self.state_file, "upgrade")
    }

    /// Path to the known-container-set file, derived from `state_file`.
    pub fn known_state_path(&self) -> String {
        sibling_path(&self.state_file, "known")
    }
}

fn sibling_path(base: &str, suffix: &str) -> String {
    match base.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{suffix}.{ext}"),
        None => format!("{base}_{suffix}"),
    }
}

fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .and_then(|out| String::from_utf8(out.stdout).ok())
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("invalid value for {name}: {value:?}; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("invalid value for {name}: {value:?}; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    match env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("invalid value for {name}: {value:?}; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

/// A zero or negative parsed value means "use the default", matching the
/// reference implementation's `_env_int_optional`.
fn env_u64_optional(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(value) => match value.trim().parse::<i64>() {
            Ok(parsed) if parsed > 0 => parsed as u64,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_str_optional(name: &str, default: Option<String>) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() { default } else { Some(trimmed.to_string()) }
        }
        Err(_) => default,
    }
}

fn env_csv_set_raw(name: &str) -> HashSet<String> {
    env::var(name)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_notification_set(name: &str) -> HashSet<String> {
    let raw = env::var(name).unwrap_or_else(|_| DEFAULT_NOTIFICATIONS.to_string());
    let normalized: HashSet<String> = raw
        .split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect();
    if normalized.is_empty() {
        return [DEFAULT_NOTIFICATIONS.to_string()].into_iter().collect();
    }
    if normalized.contains("all") {
        return ALL_NOTIFICATION_EVENTS.iter().map(|s| s.to_string()).collect();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_reference() {
        let settings = Settings::default();
        assert_eq!(settings.health_backoff_seconds, 300);
        assert_eq!(settings.restart_retry_limit, 3);
        assert_eq!(settings.notifications, ["update".to_string()].into());
    }

    #[test]
    fn sibling_paths_are_derived_from_state_file() {
        let settings = Settings {
            state_file: "/tmp/guerite_state.json".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.upgrade_state_path(), "/tmp/guerite_state_upgrade.json");
        assert_eq!(settings.known_state_path(), "/tmp/guerite_state_known.json");
    }

    #[test]
    #[serial]
    fn notification_all_expands() {
        env::set_var("GUERITE_NOTIFICATIONS_TEST_ALL", "all");
        let set = env_notification_set("GUERITE_NOTIFICATIONS_TEST_ALL");
        assert_eq!(set.len(), ALL_NOTIFICATION_EVENTS.len());
        env::remove_var("GUERITE_NOTIFICATIONS_TEST_ALL");
    }

    #[test]
    #[serial]
    fn optional_u64_zero_uses_default() {
        env::set_var("GUERITE_TEST_ZERO", "0");
        assert_eq!(env_u64_optional("GUERITE_TEST_ZERO", 180), 180);
        env::remove_var("GUERITE_TEST_ZERO");

        env::set_var("GUERITE_TEST_POS", "42");
        assert_eq!(env_u64_optional("GUERITE_TEST_POS", 180), 42);
        env::remove_var("GUERITE_TEST_POS");
    }
}
