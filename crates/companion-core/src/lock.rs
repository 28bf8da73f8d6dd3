//! Advisory, timestamp-based locks stored in the [`KvStore`].
//!
//! A lock is a JSON record under a well-known key. It counts as held only
//! while its age is below the TTL; an older record is ignored and may be taken
//! over, which is what makes a crashed holder recoverable. Acquisition and
//! release go through `compare_and_swap` so a lock that changed since it was
//! read is never overwritten or deleted by mistake.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::KvStore;

/// Persisted lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub locked: bool,
    pub timestamp: DateTime<Utc>,
    /// Random token identifying the acquisition, so release can verify ownership.
    pub holder: String,
    pub pid: u32,
}

/// Definition of one advisory lock: its store key and TTL.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    key: String,
    ttl: Duration,
}

impl AdvisoryLock {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True when a record exists and is younger than the TTL.
    ///
    /// Unparseable records count as not held.
    pub fn is_held(&self, store: &dyn KvStore, now: DateTime<Utc>) -> Result<bool> {
        let raw = store.get_string(&self.key)?;
        Ok(raw
            .as_deref()
            .and_then(|r| serde_json::from_str::<LockRecord>(r).ok())
            .is_some_and(|rec| self.is_live(&rec, now)))
    }

    /// Try to take the lock at `now`.
    ///
    /// Returns `None` when a live record exists (or another process won the
    /// race). The returned guard releases the lock when dropped.
    pub fn try_acquire<'a>(
        &self,
        store: &'a dyn KvStore,
        now: DateTime<Utc>,
    ) -> Result<Option<LockGuard<'a>>> {
        let current = store.get_string(&self.key)?;
        if let Some(ref raw) = current {
            match serde_json::from_str::<LockRecord>(raw) {
                Ok(rec) if self.is_live(&rec, now) => {
                    debug!(key = %self.key, since = %rec.timestamp, "lock held");
                    return Ok(None);
                }
                Ok(rec) => {
                    warn!(key = %self.key, since = %rec.timestamp, "ignoring stale lock");
                }
                Err(e) => {
                    warn!(key = %self.key, "ignoring unreadable lock record: {e}");
                }
            }
        }

        let record = LockRecord {
            locked: true,
            timestamp: now,
            holder: Uuid::new_v4().to_string(),
            pid: std::process::id(),
        };
        let raw = serde_json::to_string(&record)?;
        if !store.compare_and_swap(&self.key, current.as_deref(), Some(&raw))? {
            debug!(key = %self.key, "lock acquisition lost a race");
            return Ok(None);
        }

        debug!(key = %self.key, holder = %record.holder, "lock acquired");
        Ok(Some(LockGuard {
            store,
            key: self.key.clone(),
            raw,
            released: false,
        }))
    }

    fn is_live(&self, rec: &LockRecord, now: DateTime<Utc>) -> bool {
        rec.locked && now.signed_duration_since(rec.timestamp) < self.ttl
    }
}

/// Held lock. Released on [`LockGuard::release`] or drop, whichever comes first.
pub struct LockGuard<'a> {
    store: &'a dyn KvStore,
    key: String,
    raw: String,
    released: bool,
}

impl LockGuard<'_> {
    /// Release explicitly, surfacing store errors instead of only logging them.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.delete_if_ours()
    }

    fn delete_if_ours(&self) -> Result<()> {
        if !self
            .store
            .compare_and_swap(&self.key, Some(&self.raw), None)?
        {
            warn!(key = %self.key, "lock was taken over before release");
        } else {
            debug!(key = %self.key, "lock released");
        }
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.delete_if_ours() {
            warn!(key = %self.key, "failed to release lock: {e}");
        }
    }
}
