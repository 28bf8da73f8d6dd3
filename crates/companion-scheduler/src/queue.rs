use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use companion_core::{JobId, KvStore, Period, RecipientId};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SchedulerError},
    types::{DeliveryJob, JobPatch, JobStatus, QueueStats},
};

pub const QUEUE_KEY: &str = "companion_email_queue";
pub const LAST_PROCESSED_KEY: &str = "last_email_process_time";

/// Persisted list of delivery jobs.
///
/// The whole queue lives under one store key. Writers within this process are
/// serialised by `write_lock`; cross-process drains are serialised by the
/// engine's processing lock.
pub struct DeliveryQueue {
    store: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Append a new `pending` job with zero attempts.
    pub fn enqueue(
        &self,
        recipient_id: RecipientId,
        period: Period,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryJob> {
        let _w = self.write_lock.lock().unwrap();
        let mut jobs = self.load()?;
        let job = DeliveryJob {
            id: JobId::new(),
            recipient_id,
            period,
            scheduled_for,
            attempts: 0,
            last_attempt: None,
            status: JobStatus::Pending,
            error_message: None,
            cached_payload: None,
            message_id: None,
            created_at: now,
        };
        jobs.push(job.clone());
        self.save(&jobs)?;
        info!(
            job_id = %job.id,
            recipient_id = %job.recipient_id,
            %period,
            scheduled_for = %scheduled_for,
            "job enqueued"
        );
        Ok(job)
    }

    /// True when a `pending` or `sending` job exists for this pair.
    pub fn has_open_job(&self, recipient_id: &RecipientId, period: Period) -> Result<bool> {
        Ok(self.load()?.iter().any(|j| {
            &j.recipient_id == recipient_id
                && j.period == period
                && matches!(j.status, JobStatus::Pending | JobStatus::Sending)
        }))
    }

    pub fn get(&self, id: &JobId) -> Result<Option<DeliveryJob>> {
        Ok(self.load()?.into_iter().find(|j| &j.id == id))
    }

    /// All jobs in insertion order.
    pub fn list(&self) -> Result<Vec<DeliveryJob>> {
        self.load()
    }

    /// Pending jobs whose time has come and whose retry budget is not spent,
    /// ordered by `scheduled_for` (ties keep insertion order).
    ///
    /// With `backoff_secs > 0`, a retried job additionally waits
    /// `backoff_secs * 2^(attempts - 1)` after its last attempt.
    pub fn ready_jobs(
        &self,
        now: DateTime<Utc>,
        retry_attempts: u32,
        backoff_secs: u64,
    ) -> Result<Vec<DeliveryJob>> {
        let mut ready: Vec<_> = self
            .load()?
            .into_iter()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.scheduled_for <= now
                    && j.attempts < retry_attempts
                    && backoff_elapsed(j, now, backoff_secs)
            })
            .collect();
        ready.sort_by_key(|j| j.scheduled_for);
        Ok(ready)
    }

    /// Merge `patch` into job `id`. `attempts` never decreases.
    pub fn update(&self, id: &JobId, patch: JobPatch) -> Result<DeliveryJob> {
        let _w = self.write_lock.lock().unwrap();
        let mut jobs = self.load()?;
        let job = jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;

        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(attempts) = patch.attempts {
            if attempts < job.attempts {
                warn!(job_id = %id, stored = job.attempts, attempts, "ignoring attempts decrease");
            } else {
                job.attempts = attempts;
            }
        }
        if let Some(at) = patch.last_attempt {
            job.last_attempt = Some(at);
        }
        if let Some(msg) = patch.error_message {
            job.error_message = msg;
        }
        if let Some(payload) = patch.cached_payload {
            job.cached_payload = Some(payload);
        }
        if let Some(mid) = patch.message_id {
            job.message_id = Some(mid);
        }

        let updated = job.clone();
        self.save(&jobs)?;
        debug!(job_id = %id, status = %updated.status, attempts = updated.attempts, "job updated");
        Ok(updated)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let jobs = self.load()?;
        let count = |s: JobStatus| jobs.iter().filter(|j| j.status == s).count();
        let oldest_pending = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| j.scheduled_for)
            .cloned();
        Ok(QueueStats {
            total: jobs.len(),
            pending: count(JobStatus::Pending),
            sending: count(JobStatus::Sending),
            sent: count(JobStatus::Sent),
            failed: count(JobStatus::Failed),
            oldest_pending,
            last_processed: self.store.get_json(LAST_PROCESSED_KEY)?,
        })
    }

    /// Stamp the end of a drain pass.
    pub fn mark_processed(&self, now: DateTime<Utc>) -> Result<()> {
        self.store.set_json(LAST_PROCESSED_KEY, &now)?;
        Ok(())
    }

    /// Drop every job regardless of state.
    pub fn clear(&self) -> Result<usize> {
        let _w = self.write_lock.lock().unwrap();
        let n = self.load()?.len();
        self.store.delete(QUEUE_KEY)?;
        info!(count = n, "queue cleared");
        Ok(n)
    }

    /// Delete `sent`/`failed` jobs last touched before `cutoff`.
    pub fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _w = self.write_lock.lock().unwrap();
        let jobs = self.load()?;
        let before = jobs.len();
        let kept: Vec<_> = jobs
            .into_iter()
            .filter(|j| !(j.status.is_terminal() && j.last_attempt.unwrap_or(j.scheduled_for) < cutoff))
            .collect();
        let pruned = before - kept.len();
        if pruned > 0 {
            self.save(&kept)?;
            info!(count = pruned, %cutoff, "terminal jobs pruned");
        }
        Ok(pruned)
    }

    /// Mark `pending` jobs whose attempts already meet `retry_attempts` as
    /// `failed`. Happens when the budget is lowered below a job's count.
    pub fn fail_exhausted(&self, retry_attempts: u32) -> Result<usize> {
        let _w = self.write_lock.lock().unwrap();
        let mut jobs = self.load()?;
        let mut failed = 0;
        for job in jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending && j.attempts >= retry_attempts)
        {
            job.status = JobStatus::Failed;
            if job.error_message.is_none() {
                job.error_message = Some("retry budget exhausted".to_string());
            }
            failed += 1;
        }
        if failed > 0 {
            self.save(&jobs)?;
            warn!(count = failed, retry_attempts, "exhausted pending jobs failed");
        }
        Ok(failed)
    }

    /// Put `sending` jobs older than `max_age` back into play.
    ///
    /// A job stuck in `sending` means its drainer died mid-attempt. The
    /// attempt still counts: the job returns to `pending` if budget remains,
    /// otherwise it becomes `failed`.
    pub fn recover_stale_sending(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
        retry_attempts: u32,
    ) -> Result<usize> {
        let _w = self.write_lock.lock().unwrap();
        let mut jobs = self.load()?;
        let mut recovered = 0;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Sending) {
            let started = job.last_attempt.unwrap_or(job.scheduled_for);
            if now - started < max_age {
                continue;
            }
            job.status = if job.attempts >= retry_attempts {
                JobStatus::Failed
            } else {
                JobStatus::Pending
            };
            job.error_message = Some("attempt interrupted".to_string());
            recovered += 1;
        }
        if recovered > 0 {
            self.save(&jobs)?;
            warn!(count = recovered, "stale sending jobs recovered");
        }
        Ok(recovered)
    }

    fn load(&self) -> Result<Vec<DeliveryJob>> {
        Ok(self
            .store
            .get_json::<Vec<DeliveryJob>>(QUEUE_KEY)?
            .unwrap_or_default())
    }

    fn save(&self, jobs: &[DeliveryJob]) -> Result<()> {
        self.store.set_json(QUEUE_KEY, &jobs)?;
        Ok(())
    }
}

fn backoff_elapsed(job: &DeliveryJob, now: DateTime<Utc>, backoff_secs: u64) -> bool {
    if backoff_secs == 0 || job.attempts == 0 {
        return true;
    }
    let Some(last) = job.last_attempt else {
        return true;
    };
    let factor = 1i64 << (job.attempts - 1).min(16);
    // out-of-range waits never elapse
    let Some(wait) = i64::try_from(backoff_secs)
        .ok()
        .and_then(|secs| secs.checked_mul(factor))
        .and_then(Duration::try_seconds)
    else {
        return false;
    };
    now.signed_duration_since(last) >= wait
}
