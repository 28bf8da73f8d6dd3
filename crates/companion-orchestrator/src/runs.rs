use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use companion_core::KvStore;

use crate::{
    error::Result,
    types::{JobExecutionResult, RunConfig},
};

pub const RUN_CONFIG_KEY: &str = "background_job_config";
pub const RUN_HISTORY_KEY: &str = "background_job_history";

/// Persisted [`RunConfig`] plus a bounded history of execution results.
pub struct RunLedger {
    store: Arc<dyn KvStore>,
    default_interval_minutes: u32,
    history_limit: usize,
    write_lock: Mutex<()>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn KvStore>, default_interval_minutes: u32, history_limit: usize) -> Self {
        Self {
            store,
            default_interval_minutes,
            history_limit,
            write_lock: Mutex::new(()),
        }
    }

    /// Stored record, or a fresh default (not written) when none exists.
    pub fn get(&self, now: DateTime<Utc>) -> Result<RunConfig> {
        Ok(self
            .store
            .get_json::<RunConfig>(RUN_CONFIG_KEY)?
            .unwrap_or_else(|| RunConfig::new(self.default_interval_minutes, now)))
    }

    /// Read-modify-write of the record.
    pub fn update(
        &self,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut RunConfig),
    ) -> Result<RunConfig> {
        let _w = self.write_lock.lock().unwrap();
        let mut cfg = self.get(now)?;
        apply(&mut cfg);
        self.store.set_json(RUN_CONFIG_KEY, &cfg)?;
        Ok(cfg)
    }

    /// Append `result`, evicting the oldest entries beyond the limit.
    pub fn record(&self, result: &JobExecutionResult) -> Result<()> {
        if self.history_limit == 0 {
            return Ok(());
        }
        let _w = self.write_lock.lock().unwrap();
        let mut history = self.history()?;
        history.push(result.clone());
        if history.len() > self.history_limit {
            let excess = history.len() - self.history_limit;
            history.drain(..excess);
        }
        self.store.set_json(RUN_HISTORY_KEY, &history)?;
        Ok(())
    }

    /// Oldest first.
    pub fn history(&self) -> Result<Vec<JobExecutionResult>> {
        Ok(self
            .store
            .get_json::<Vec<JobExecutionResult>>(RUN_HISTORY_KEY)?
            .unwrap_or_default())
    }
}
