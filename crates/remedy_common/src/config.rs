//! Configuration management for remedyd.
//!
//! Loads settings from /etc/remedy/config.toml or uses defaults. The daemon
//! keeps the parsed config behind a shared lock and re-reads a snapshot at
//! every retry decision, so a runtime change (kill switch, budget, backoff)
//! affects the next attempt without a restart.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/remedy/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/remedy/config.toml";

/// Healing policy: kill switch, retry budget, backoff shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Master kill switch; false stops all new attempts
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// false means detect-and-report only, no remediation
    #[serde(default = "default_auto_execute")]
    pub auto_execute: bool,

    /// Attempts per escalation cycle before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_fault: u32,

    /// Window for escalation accounting; a cycle older than this restarts
    /// its counter instead of escalating
    #[serde(default = "default_attempt_window")]
    pub attempt_window_secs: u64,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Backoff cap
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_auto_execute() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_window() -> u64 {
    1800
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_ceiling() -> u64 {
    300
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            auto_execute: default_auto_execute(),
            max_attempts_per_fault: default_max_attempts(),
            attempt_window_secs: default_attempt_window(),
            backoff_base_secs: default_backoff_base(),
            backoff_ceiling_secs: default_backoff_ceiling(),
        }
    }
}

/// Scan loop and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Scan loop interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum concurrent heal cycles across all faults
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_worker_limit() -> usize {
    4
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            worker_limit: default_worker_limit(),
        }
    }
}

/// Verification sub-attempt plan for one category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerifyPlan {
    /// Sub-attempts before giving up on confirmation
    #[serde(default = "default_verify_attempts")]
    pub attempts: u32,

    /// Delay between sub-attempts (remediation effects are not instant)
    #[serde(default = "default_verify_delay")]
    pub delay_secs: u64,
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_verify_delay() -> u64 {
    2
}

impl Default for VerifyPlan {
    fn default() -> Self {
        Self {
            attempts: default_verify_attempts(),
            delay_secs: default_verify_delay(),
        }
    }
}

impl VerifyPlan {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Verifier configuration with per-category overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyConfig {
    #[serde(default)]
    pub default: VerifyPlan,

    /// Keyed by category string ("service-down", "network-broken", ...)
    #[serde(default)]
    pub overrides: HashMap<String, VerifyPlan>,
}

impl VerifyConfig {
    /// Plan for a category: override if present, default otherwise.
    pub fn plan_for(&self, category: &str) -> VerifyPlan {
        self.overrides.get(category).copied().unwrap_or(self.default)
    }
}

/// Action selection overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Per-category ordered action-name priority; listed actions are tried
    /// first, in list order, ahead of catalog ordering
    #[serde(default)]
    pub priority: HashMap<String, Vec<String>>,
}

/// Outbound notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook receiving structured events; unset means log-only
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Per-delivery timeout; one attempt, drop on failure
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

fn default_notify_timeout() -> u64 {
    5
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

/// HTTP API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:7044".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// History retention. Pruning only ever touches faults in a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_attempt_max_age")]
    pub attempt_max_age_days: u64,
}

fn default_attempt_max_age() -> u64 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            attempt_max_age_days: default_attempt_max_age(),
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub healing: HealingConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub actions: ActionConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Load config from file, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save default config to path (for init)
    pub fn save_default(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let config = Config::default();
        let content = toml::to_string_pretty(&config)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        info!("Saved default config to {}", path.display());
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs.max(1))
    }

    pub fn attempt_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.healing.attempt_window_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.healing.enabled);
        assert!(config.healing.auto_execute);
        assert_eq!(config.healing.max_attempts_per_fault, 3);
        assert_eq!(config.monitor.poll_interval_secs, 5);
        assert_eq!(config.verify.default.attempts, 3);
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[healing]
enabled = true
auto_execute = false
max_attempts_per_fault = 5
backoff_base_secs = 2

[notify]
webhook_url = "http://127.0.0.1:9000/hook"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(!config.healing.auto_execute);
        assert_eq!(config.healing.max_attempts_per_fault, 5);
        assert_eq!(config.healing.backoff_base_secs, 2);
        // Defaults for missing fields
        assert_eq!(config.healing.backoff_ceiling_secs, 300);
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("http://127.0.0.1:9000/hook")
        );
    }

    #[test]
    fn test_verify_overrides() {
        let toml_str = r#"
[verify.default]
attempts = 2
delay_secs = 1

[verify.overrides.network-broken]
attempts = 6
delay_secs = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let net = config.verify.plan_for("network-broken");
        assert_eq!(net.attempts, 6);
        assert_eq!(net.delay_secs, 5);
        let svc = config.verify.plan_for("service-down");
        assert_eq!(svc.attempts, 2);
        assert_eq!(svc.delay_secs, 1);
    }

    #[test]
    fn test_action_priority_overrides() {
        let toml_str = r#"
[actions.priority]
service-down = ["clear-service-cache", "restart-service"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let list = config.actions.priority.get("service-down").unwrap();
        assert_eq!(list[0], "clear-service-cache");
    }

    #[test]
    fn test_config_missing_sections_falls_back() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7044");
        assert_eq!(config.retention.attempt_max_age_days, 30);
    }

    #[test]
    fn test_load_from_missing_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such.toml");
        assert!(Config::load_from_path(&missing).is_err());
    }

    #[test]
    fn test_save_and_reload_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::save_default(&path).unwrap();
        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.healing.max_attempts_per_fault, 3);
    }
}
