use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MAX_RETRY_BACKOFF_SECS;
use crate::error::{CoreError, Result};
use crate::store::KvStore;
use crate::types::parse_utc_offset;

/// Store key of the process-wide system record.
pub const SYSTEM_CONFIG_KEY: &str = "email_system_config";

/// Process-wide delivery settings, persisted alongside the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub enabled: bool,
    /// Fixed UTC offset used for calendar rules (`UTC`, `-03:00`, ...).
    pub timezone: String,
    /// Local hour (0–23) at which reports are scheduled.
    pub sending_hour: u32,
    /// Maximum number of jobs attempted per drain pass.
    pub max_per_pass: u32,
    /// Attempt budget per job before it becomes `failed`.
    pub retry_attempts: u32,
    /// Base back-off between retries. 0 retries on the very next drain pass.
    #[serde(default)]
    pub retry_backoff_secs: u64,
    pub last_system_check: DateTime<Utc>,
}

impl SystemConfig {
    /// Resolved offset. Falls back to UTC if the stored value was corrupted.
    pub fn offset(&self) -> FixedOffset {
        parse_utc_offset(&self.timezone).unwrap_or_else(|| Utc.fix())
    }

    fn validate(&self) -> Result<()> {
        if self.sending_hour > 23 {
            return Err(CoreError::Validation(format!(
                "sending hour must be 0-23, got {}",
                self.sending_hour
            )));
        }
        if self.max_per_pass == 0 {
            return Err(CoreError::Validation("max per pass must be at least 1".into()));
        }
        if self.retry_attempts == 0 {
            return Err(CoreError::Validation("retry attempts must be at least 1".into()));
        }
        if self.retry_backoff_secs > MAX_RETRY_BACKOFF_SECS {
            return Err(CoreError::Validation(format!(
                "retry backoff must be at most {MAX_RETRY_BACKOFF_SECS}s, got {}",
                self.retry_backoff_secs
            )));
        }
        if parse_utc_offset(&self.timezone).is_none() {
            return Err(CoreError::InvalidTimezone(self.timezone.clone()));
        }
        Ok(())
    }
}

/// Partial update for [`SystemConfig`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfigPatch {
    pub enabled: Option<bool>,
    pub timezone: Option<String>,
    pub sending_hour: Option<u32>,
    pub max_per_pass: Option<u32>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_secs: Option<u64>,
}

/// Read/write access to the persisted [`SystemConfig`].
///
/// When nothing is stored yet the configured defaults are returned (and not
/// written), so a fresh install behaves according to the config file.
pub struct SystemSettings {
    store: Arc<dyn KvStore>,
    defaults: SystemConfig,
}

impl SystemSettings {
    pub fn new(store: Arc<dyn KvStore>, defaults: SystemConfig) -> Self {
        Self { store, defaults }
    }

    pub fn get(&self) -> Result<SystemConfig> {
        Ok(self
            .store
            .get_json::<SystemConfig>(SYSTEM_CONFIG_KEY)?
            .unwrap_or_else(|| self.defaults.clone()))
    }

    /// Apply `patch`, validate the result and persist it with a fresh
    /// `last_system_check`.
    pub fn update(&self, patch: SystemConfigPatch, now: DateTime<Utc>) -> Result<SystemConfig> {
        let mut cfg = self.get()?;
        if let Some(v) = patch.enabled {
            cfg.enabled = v;
        }
        if let Some(v) = patch.timezone {
            cfg.timezone = v;
        }
        if let Some(v) = patch.sending_hour {
            cfg.sending_hour = v;
        }
        if let Some(v) = patch.max_per_pass {
            cfg.max_per_pass = v;
        }
        if let Some(v) = patch.retry_attempts {
            cfg.retry_attempts = v;
        }
        if let Some(v) = patch.retry_backoff_secs {
            cfg.retry_backoff_secs = v;
        }
        cfg.validate()?;
        cfg.last_system_check = now;
        self.store.set_json(SYSTEM_CONFIG_KEY, &cfg)?;
        info!(
            enabled = cfg.enabled,
            sending_hour = cfg.sending_hour,
            timezone = %cfg.timezone,
            "system config updated"
        );
        Ok(cfg)
    }
}
