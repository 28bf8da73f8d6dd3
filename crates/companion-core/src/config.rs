use chrono::Utc;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::system::SystemConfig;

// Engine constants; overridable through the config file where noted.
pub const DEFAULT_SENDING_HOUR: u32 = 8;
pub const DEFAULT_MAX_PER_PASS: u32 = 20;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_SEND_DELAY_SECS: u64 = 3; // courtesy gap between two sends
pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 5 * 60;
pub const PROCESSING_LOCK_TTL_SECS: u64 = 15 * 60;
pub const MAX_RETRY_BACKOFF_SECS: u64 = 7 * 24 * 60 * 60;
pub const JOB_LOCK_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_RUN_INTERVAL_MINUTES: u32 = 60;
pub const MIN_RUN_INTERVAL_MINUTES: u32 = 15;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_BACKGROUND_RECHECK_SECS: u64 = 5 * 60;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Top-level config (companion.toml + COMPANION_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanionConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub owner: OwnerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// The single data owner whose readings the reports summarise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerConfig {
    /// Opaque owner key handed to the report generator.
    #[serde(default = "default_owner_id")]
    pub id: String,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            id: default_owner_id(),
        }
    }
}

/// Seed values for the persisted system record plus engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_sending_hour")]
    pub sending_hour: u32,
    #[serde(default = "default_max_per_pass")]
    pub max_per_pass: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// 0 keeps the immediate-retry behaviour.
    #[serde(default)]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_send_delay_secs")]
    pub send_delay_secs: u64,
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    #[serde(default = "default_processing_lock_ttl_secs")]
    pub processing_lock_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: default_timezone(),
            sending_hour: DEFAULT_SENDING_HOUR,
            max_per_pass: DEFAULT_MAX_PER_PASS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_secs: 0,
            send_delay_secs: DEFAULT_SEND_DELAY_SECS,
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            processing_lock_ttl_secs: PROCESSING_LOCK_TTL_SECS,
        }
    }
}

impl SchedulerConfig {
    /// System record used until the first explicit update is stored.
    pub fn system_defaults(&self) -> SystemConfig {
        SystemConfig {
            enabled: self.enabled,
            timezone: self.timezone.clone(),
            sending_hour: self.sending_hour,
            max_per_pass: self.max_per_pass,
            retry_attempts: self.retry_attempts,
            retry_backoff_secs: self.retry_backoff_secs,
            last_system_check: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_run_interval_minutes")]
    pub run_interval_minutes: u32,
    /// Cadence of the recurring wake-up timer.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Delay of the follow-up check after moving to the background.
    #[serde(default = "default_background_recheck_secs")]
    pub background_recheck_secs: u64,
    #[serde(default = "default_job_lock_ttl_secs")]
    pub job_lock_ttl_secs: u64,
    /// Number of execution results kept in the run history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run_interval_minutes: DEFAULT_RUN_INTERVAL_MINUTES,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            background_recheck_secs: DEFAULT_BACKGROUND_RECHECK_SECS,
            job_lock_ttl_secs: JOB_LOCK_TTL_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportConfig {
    pub resend: Option<ResendConfig>,
}

/// Resend-compatible HTTP email API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResendConfig {
    pub api_key: String,
    /// Sender address, e.g. `"Reports <reports@example.com>"`.
    pub from: String,
    #[serde(default = "default_resend_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportsConfig {
    /// Analytics endpoint that returns a report payload as JSON.
    pub source_url: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_sending_hour() -> u32 {
    DEFAULT_SENDING_HOUR
}
fn default_max_per_pass() -> u32 {
    DEFAULT_MAX_PER_PASS
}
fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}
fn default_send_delay_secs() -> u64 {
    DEFAULT_SEND_DELAY_SECS
}
fn default_drain_interval_secs() -> u64 {
    DEFAULT_DRAIN_INTERVAL_SECS
}
fn default_processing_lock_ttl_secs() -> u64 {
    PROCESSING_LOCK_TTL_SECS
}
fn default_run_interval_minutes() -> u32 {
    DEFAULT_RUN_INTERVAL_MINUTES
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_background_recheck_secs() -> u64 {
    DEFAULT_BACKGROUND_RECHECK_SECS
}
fn default_job_lock_ttl_secs() -> u64 {
    JOB_LOCK_TTL_SECS
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_resend_base_url() -> String {
    "https://api.resend.com".to_string()
}
fn default_owner_id() -> String {
    "owner".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.companion/companion.db", home)
}

impl CompanionConfig {
    /// Load config from a TOML file with COMPANION_* env var overrides.
    ///
    /// Nested keys use a double underscore: `COMPANION_SCHEDULER__SENDING_HOUR=19`.
    /// Without an explicit path, `~/.companion/companion.toml` is read.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CompanionConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COMPANION_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.companion/companion.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CompanionConfig::load(Some("/nonexistent/companion.toml")).unwrap();
        assert_eq!(cfg.scheduler.sending_hour, DEFAULT_SENDING_HOUR);
        assert_eq!(cfg.orchestrator.run_interval_minutes, 60);
        assert!(cfg.transport.resend.is_none());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("companion.toml");
        std::fs::write(
            &path,
            r#"
[owner]
id = "patient-42"

[scheduler]
sending_hour = 19
timezone = "-03:00"
max_per_pass = 5

[transport.resend]
api_key = "re_test"
from = "Reports <reports@example.com>"
"#,
        )
        .unwrap();

        let cfg = CompanionConfig::load(path.to_str()).unwrap();
        assert_eq!(cfg.owner.id, "patient-42");
        assert_eq!(cfg.scheduler.sending_hour, 19);
        assert_eq!(cfg.scheduler.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        let resend = cfg.transport.resend.unwrap();
        assert_eq!(resend.base_url, "https://api.resend.com");

        let sys = cfg.scheduler.system_defaults();
        assert_eq!(sys.max_per_pass, 5);
        assert_eq!(sys.offset().local_minus_utc(), -3 * 3600);
    }
}
