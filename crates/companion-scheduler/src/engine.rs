use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use companion_core::{
    config::{SchedulerConfig, PROCESSING_LOCK_TTL_SECS},
    AdvisoryLock, Clock, KvStore, Period, SystemConfig, SystemSettings,
};
use companion_recipients::RecipientRegistry;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    collab::{
        DeliveryError, DeliveryTransport, ReportGenerator, ReportRequest, SendReceipt,
        TemplateRenderer,
    },
    error::Result,
    queue::DeliveryQueue,
    schedule::{scheduled_for, subject_for},
    types::{DeliveryJob, JobPatch, JobStatus},
};

pub const PROCESSING_LOCK_KEY: &str = "email_processing_lock";

/// The three external collaborators a delivery goes through.
#[derive(Clone)]
pub struct Collaborators {
    pub reports: Arc<dyn ReportGenerator>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub transport: Arc<dyn DeliveryTransport>,
}

/// Engine tuning that does not live in the persisted system config.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Data owner whose reports are generated.
    pub owner_id: String,
    /// Pause between two sends within one drain.
    pub send_delay: std::time::Duration,
    /// Period of the engine's own drain loop.
    pub drain_interval: std::time::Duration,
    pub processing_lock_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            owner_id: "owner".to_string(),
            send_delay: std::time::Duration::from_secs(3),
            drain_interval: std::time::Duration::from_secs(300),
            processing_lock_ttl: Duration::seconds(PROCESSING_LOCK_TTL_SECS as i64),
        }
    }
}

impl EngineOptions {
    pub fn from_config(cfg: &SchedulerConfig, owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            send_delay: std::time::Duration::from_secs(cfg.send_delay_secs),
            drain_interval: std::time::Duration::from_secs(cfg.drain_interval_secs.max(1)),
            processing_lock_ttl: Duration::seconds(cfg.processing_lock_ttl_secs as i64),
        }
    }
}

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutSummary {
    pub enqueued: usize,
    /// Due recipients skipped because an open job already covers them.
    pub already_queued: usize,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Another drainer held the processing lock; nothing was touched.
    pub lock_held: bool,
    /// Jobs ready at the start of the pass.
    pub ready: usize,
    pub attempted: usize,
    pub sent: usize,
    /// Failed attempts left `pending` for a later pass.
    pub retrying: usize,
    /// Failed attempts that exhausted the budget.
    pub failed: usize,
    /// Jobs whose bookkeeping hit a store error.
    pub errors: usize,
}

enum Attempt {
    Sent,
    Retrying,
    Failed,
}

/// Fans due recipients out into jobs and drains the queue through the
/// collaborators.
pub struct SchedulingEngine {
    store: Arc<dyn KvStore>,
    registry: Arc<RecipientRegistry>,
    settings: Arc<SystemSettings>,
    clock: Arc<dyn Clock>,
    queue: DeliveryQueue,
    collab: Collaborators,
    processing_lock: AdvisoryLock,
    opts: EngineOptions,
}

impl SchedulingEngine {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: Arc<RecipientRegistry>,
        settings: Arc<SystemSettings>,
        clock: Arc<dyn Clock>,
        collab: Collaborators,
        opts: EngineOptions,
    ) -> Self {
        Self {
            queue: DeliveryQueue::new(Arc::clone(&store)),
            processing_lock: AdvisoryLock::new(PROCESSING_LOCK_KEY, opts.processing_lock_ttl),
            store,
            registry,
            settings,
            clock,
            collab,
            opts,
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn registry(&self) -> &RecipientRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    /// True while some drainer (here or in another process) holds the lock.
    pub fn is_processing(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.processing_lock.is_held(self.store.as_ref(), now)?)
    }

    /// Enqueue one job per due recipient and period.
    ///
    /// A recipient that already has an open job for the period is skipped,
    /// so back-to-back passes never duplicate work. Pending jobs with a spent
    /// budget are failed first and do not count as open.
    pub fn fan_out(&self, now: DateTime<Utc>) -> Result<FanOutSummary> {
        let cfg = self.settings.get()?;
        self.queue.fail_exhausted(cfg.retry_attempts)?;
        let local = now.with_timezone(&cfg.offset());
        let mut summary = FanOutSummary::default();

        for period in Period::ALL {
            let due = self.registry.due_for_period(period, local)?;
            if due.is_empty() {
                debug!(%period, "no recipients due");
                continue;
            }
            for recipient in due {
                if self.queue.has_open_job(&recipient.id, period)? {
                    summary.already_queued += 1;
                    continue;
                }
                let Some(at) = scheduled_for(
                    period,
                    local,
                    cfg.sending_hour,
                    recipient.last_sent.get(period),
                ) else {
                    warn!(recipient_id = %recipient.id, %period, "could not compute schedule");
                    continue;
                };
                self.queue.enqueue(recipient.id, period, at, now)?;
                summary.enqueued += 1;
            }
        }

        info!(
            enqueued = summary.enqueued,
            already_queued = summary.already_queued,
            "fan-out complete"
        );
        Ok(summary)
    }

    /// Deliver up to `max_per_pass` ready jobs under the processing lock.
    ///
    /// Returns a report with `lock_held` set, and touches nothing, when
    /// another drain holds a live lock. The lock is released on every path,
    /// including unwinding.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let Some(guard) = self.processing_lock.try_acquire(self.store.as_ref(), now)? else {
            info!("drain skipped: processing lock held");
            return Ok(DrainReport {
                lock_held: true,
                ..Default::default()
            });
        };

        let result = self.drain_locked(now).await;
        if let Err(e) = guard.release() {
            warn!("failed to release processing lock: {e}");
        }
        result
    }

    /// Fan out, then drain.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<(FanOutSummary, DrainReport)> {
        let fan_out = self.fan_out(now)?;
        let drain = self.drain(now).await?;
        Ok((fan_out, drain))
    }

    /// Periodic drain loop. Runs until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            every_secs = self.opts.drain_interval.as_secs(),
            "drain loop started"
        );
        self.recover_on_startup();

        let mut interval = tokio::time::interval(self.opts.drain_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.drain(self.clock.now()).await {
                        error!("drain error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("drain loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    /// Release jobs left in `sending` by a crashed drainer.
    fn recover_on_startup(&self) {
        let retry_attempts = match self.settings.get() {
            Ok(cfg) => cfg.retry_attempts,
            Err(e) => {
                error!("cannot read system config for recovery: {e}");
                return;
            }
        };
        if let Err(e) = self.queue.recover_stale_sending(
            self.clock.now(),
            self.opts.processing_lock_ttl,
            retry_attempts,
        ) {
            error!("stale-sending recovery failed: {e}");
        }
    }

    async fn drain_locked(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let cfg = self.settings.get()?;
        self.queue.fail_exhausted(cfg.retry_attempts)?;
        let ready = self
            .queue
            .ready_jobs(now, cfg.retry_attempts, cfg.retry_backoff_secs)?;
        let batch = ready.len().min(cfg.max_per_pass as usize);
        let mut report = DrainReport {
            ready: ready.len(),
            ..Default::default()
        };

        if batch == 0 {
            debug!("no jobs ready");
        } else {
            info!(ready = ready.len(), batch, "draining queue");
        }

        for (i, job) in ready.into_iter().take(batch).enumerate() {
            if i > 0 && !self.opts.send_delay.is_zero() {
                tokio::time::sleep(self.opts.send_delay).await;
            }
            report.attempted += 1;
            let job_id = job.id.clone();
            // per-attempt time, never before the pass started
            let at = self.clock.now().max(now);
            match self.process_job(job, &cfg, at).await {
                Ok(Attempt::Sent) => report.sent += 1,
                Ok(Attempt::Retrying) => report.retrying += 1,
                Ok(Attempt::Failed) => report.failed += 1,
                Err(e) => {
                    error!(job_id = %job_id, "job bookkeeping failed: {e}");
                    report.errors += 1;
                }
            }
        }

        self.queue.mark_processed(self.clock.now().max(now))?;
        Ok(report)
    }

    async fn process_job(
        &self,
        job: DeliveryJob,
        cfg: &SystemConfig,
        now: DateTime<Utc>,
    ) -> Result<Attempt> {
        let attempts = job.attempts + 1;
        self.queue.update(
            &job.id,
            JobPatch {
                status: Some(JobStatus::Sending),
                attempts: Some(attempts),
                last_attempt: Some(now),
                ..Default::default()
            },
        )?;

        match self.deliver(&job, cfg, now).await {
            Ok(receipt) => {
                self.queue.update(
                    &job.id,
                    JobPatch {
                        status: Some(JobStatus::Sent),
                        error_message: Some(None),
                        message_id: receipt.message_id.clone(),
                        ..Default::default()
                    },
                )?;
                if let Err(e) = self.registry.record_sent(&job.recipient_id, job.period, now) {
                    warn!(job_id = %job.id, recipient_id = %job.recipient_id, "could not record delivery: {e}");
                }
                info!(
                    job_id = %job.id,
                    recipient_id = %job.recipient_id,
                    period = %job.period,
                    message_id = receipt.message_id.as_deref().unwrap_or("-"),
                    "report delivered"
                );
                Ok(Attempt::Sent)
            }
            Err(e) => {
                let (status, outcome) = if attempts >= cfg.retry_attempts {
                    (JobStatus::Failed, Attempt::Failed)
                } else {
                    (JobStatus::Pending, Attempt::Retrying)
                };
                warn!(
                    job_id = %job.id,
                    attempt = attempts,
                    max = cfg.retry_attempts,
                    next_status = %status,
                    "delivery failed: {e}"
                );
                self.queue.update(
                    &job.id,
                    JobPatch {
                        status: Some(status),
                        error_message: Some(Some(e.to_string())),
                        ..Default::default()
                    },
                )?;
                Ok(outcome)
            }
        }
    }

    /// Generate (or reuse), render and send one job's report.
    async fn deliver(
        &self,
        job: &DeliveryJob,
        cfg: &SystemConfig,
        now: DateTime<Utc>,
    ) -> std::result::Result<SendReceipt, DeliveryError> {
        let recipient = self
            .registry
            .get(&job.recipient_id)
            .map_err(|e| DeliveryError::Internal(e.to_string()))?
            .ok_or_else(|| DeliveryError::RecipientGone {
                id: job.recipient_id.to_string(),
            })?;

        let payload = match &job.cached_payload {
            Some(p) => p.clone(),
            None => {
                let req = ReportRequest {
                    owner_id: self.opts.owner_id.clone(),
                    recipient_id: job.recipient_id.clone(),
                    period: job.period,
                    as_of: now,
                };
                let p = self.collab.reports.generate(&req).await?;
                self.queue
                    .update(
                        &job.id,
                        JobPatch {
                            cached_payload: Some(p.clone()),
                            ..Default::default()
                        },
                    )
                    .map_err(|e| DeliveryError::Internal(e.to_string()))?;
                p
            }
        };

        let document = self.collab.renderer.render(&payload).await?;
        let subject = subject_for(job.period, payload.range_start, cfg.offset());
        debug!(
            job_id = %job.id,
            transport = self.collab.transport.name(),
            %subject,
            "sending report"
        );
        self.collab
            .transport
            .send(&recipient.address, &subject, &document)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use companion_core::{ManualClock, MemoryKvStore, SystemConfigPatch};
    use companion_recipients::{PeriodFlags, RecipientPatch};

    use crate::collab::{Document, ReportPayload};

    fn t0() -> DateTime<Utc> {
        // Saturday 08:05 UTC
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 5, 0).unwrap()
    }

    struct FakeReports {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReportGenerator for FakeReports {
        async fn generate(&self, req: &ReportRequest) -> std::result::Result<ReportPayload, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DeliveryError::Report("no data".into()));
            }
            Ok(ReportPayload {
                owner_id: req.owner_id.clone(),
                period: req.period,
                range_start: req.as_of,
                range_end: req.as_of,
                generated_at: req.as_of,
                content: serde_json::json!({"readings": 3}),
            })
        }
    }

    struct PlainRenderer;

    #[async_trait]
    impl TemplateRenderer for PlainRenderer {
        async fn render(&self, p: &ReportPayload) -> std::result::Result<Document, DeliveryError> {
            Ok(Document {
                content_type: "text/plain".into(),
                body: p.content.to_string(),
            })
        }
    }

    /// Fails the first `fail_first` sends, then succeeds. Each send moves
    /// `clock` forward by `tick`.
    struct FlakyTransport {
        fail_first: usize,
        sends: Mutex<Vec<(String, String)>>,
        calls: AtomicUsize,
        clock: Arc<ManualClock>,
        tick: Duration,
    }

    impl FlakyTransport {
        fn new(fail_first: usize, clock: Arc<ManualClock>, tick: Duration) -> Self {
            Self {
                fail_first,
                sends: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                clock,
                tick,
            }
        }
    }

    #[async_trait]
    impl DeliveryTransport for FlakyTransport {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(
            &self,
            address: &str,
            subject: &str,
            _doc: &Document,
        ) -> std::result::Result<SendReceipt, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.clock.advance(self.tick);
            if n < self.fail_first {
                return Err(DeliveryError::Transport("503".into()));
            }
            self.sends
                .lock()
                .unwrap()
                .push((address.to_string(), subject.to_string()));
            Ok(SendReceipt {
                message_id: Some(format!("msg-{n}")),
            })
        }
    }

    struct Harness {
        engine: SchedulingEngine,
        registry: Arc<RecipientRegistry>,
        reports: Arc<FakeReports>,
        transport: Arc<FlakyTransport>,
        store: Arc<dyn KvStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(fail_reports: bool, fail_sends: usize) -> Harness {
        harness_with_tick(fail_reports, fail_sends, Duration::zero())
    }

    fn harness_with_tick(fail_reports: bool, fail_sends: usize, tick: Duration) -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let registry = Arc::new(RecipientRegistry::new(Arc::clone(&store), clock.clone()));
        let settings = Arc::new(SystemSettings::new(
            Arc::clone(&store),
            companion_core::config::SchedulerConfig::default().system_defaults(),
        ));
        settings
            .update(
                SystemConfigPatch {
                    enabled: Some(true),
                    ..Default::default()
                },
                t0(),
            )
            .unwrap();
        let reports = Arc::new(FakeReports {
            calls: AtomicUsize::new(0),
            fail: fail_reports,
        });
        let transport = Arc::new(FlakyTransport::new(fail_sends, clock.clone(), tick));
        let engine = SchedulingEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            settings,
            clock.clone(),
            Collaborators {
                reports: reports.clone(),
                renderer: Arc::new(PlainRenderer),
                transport: transport.clone(),
            },
            EngineOptions {
                send_delay: std::time::Duration::ZERO,
                ..Default::default()
            },
        );
        Harness {
            engine,
            registry,
            reports,
            transport,
            store,
            clock,
        }
    }

    fn add_verified(h: &Harness, addr: &str, periods: PeriodFlags) -> companion_core::RecipientId {
        let r = h.registry.add_recipient(addr, "Dr", periods).unwrap();
        h.registry
            .update_recipient(
                &r.id,
                RecipientPatch {
                    verified: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        r.id
    }

    fn daily_only() -> PeriodFlags {
        PeriodFlags {
            daily: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fan_out_enqueues_per_period_and_dedups() {
        let h = harness(false, 0);
        add_verified(&h, "a@x.io", PeriodFlags::all());
        let unverified = h.registry.add_recipient("b@x.io", "B", PeriodFlags::all()).unwrap();

        let first = h.engine.fan_out(t0()).unwrap();
        assert_eq!(first.enqueued, 3);
        let second = h.engine.fan_out(t0()).unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.already_queued, 3);

        let jobs = h.engine.queue().list().unwrap();
        assert!(jobs.iter().all(|j| j.recipient_id != unverified.id));
    }

    #[tokio::test]
    async fn drain_sends_and_records_delivery() {
        let h = harness(false, 0);
        let id = add_verified(&h, "a@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();

        let report = h.engine.drain(t0()).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(!report.lock_held);

        let job = &h.engine.queue().list().unwrap()[0];
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.message_id.as_deref(), Some("msg-0"));

        let r = h.registry.get(&id).unwrap().unwrap();
        assert_eq!(r.last_sent.daily, Some(t0()));
        assert_eq!(
            h.transport.sends.lock().unwrap()[0],
            ("a@x.io".to_string(), "Daily report - 01/03/2025".to_string())
        );
        assert!(!h.engine.is_processing(t0()).unwrap());
        assert_eq!(h.engine.queue().stats().unwrap().last_processed, Some(t0()));
    }

    #[tokio::test]
    async fn retries_reuse_cached_payload_until_budget() {
        let h = harness(false, 10);
        add_verified(&h, "a@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();

        for i in 1..=3 {
            let report = h.engine.drain(t0()).await.unwrap();
            assert_eq!(report.attempted, 1);
            let job = &h.engine.queue().list().unwrap()[0];
            assert_eq!(job.attempts, i);
            assert!(job.cached_payload.is_some());
        }
        let job = &h.engine.queue().list().unwrap()[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("transport error: 503"));
        assert_eq!(h.reports.calls.load(Ordering::SeqCst), 1);

        // budget spent: nothing more is attempted
        let report = h.engine.drain(t0()).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_then_success() {
        let h = harness(false, 1);
        add_verified(&h, "a@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();

        let first = h.engine.drain(t0()).await.unwrap();
        assert_eq!(first.retrying, 1);
        let second = h.engine.drain(t0()).await.unwrap();
        assert_eq!(second.sent, 1);

        let job = &h.engine.queue().list().unwrap()[0];
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error_message, None);
    }

    #[tokio::test]
    async fn report_failure_is_a_failed_attempt() {
        let h = harness(true, 0);
        add_verified(&h, "a@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();

        let report = h.engine.drain(t0()).await.unwrap();
        assert_eq!(report.retrying, 1);
        let job = &h.engine.queue().list().unwrap()[0];
        assert!(job.cached_payload.is_none());
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn removed_recipient_fails_its_attempts() {
        let h = harness(false, 0);
        let id = add_verified(&h, "a@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();
        h.registry.remove(&id).unwrap();

        let report = h.engine.drain(t0()).await.unwrap();
        assert_eq!(report.retrying, 1);
        let job = &h.engine.queue().list().unwrap()[0];
        assert!(job.error_message.as_deref().unwrap().contains("recipient not found"));
    }

    #[tokio::test]
    async fn live_lock_skips_drain() {
        let h = harness(false, 0);
        add_verified(&h, "a@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();

        let other = AdvisoryLock::new(PROCESSING_LOCK_KEY, Duration::minutes(15));
        let _held = other.try_acquire(h.store.as_ref(), t0()).unwrap().unwrap();

        let report = h.engine.drain(t0()).await.unwrap();
        assert!(report.lock_held);
        assert_eq!(report.attempted, 0);
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drain_caps_at_max_per_pass() {
        let h = harness(false, 0);
        for i in 0..5 {
            add_verified(&h, &format!("r{i}@x.io"), daily_only());
        }
        h.engine
            .settings()
            .update(
                SystemConfigPatch {
                    max_per_pass: Some(2),
                    ..Default::default()
                },
                t0(),
            )
            .unwrap();
        h.engine.fan_out(t0()).unwrap();

        let report = h.engine.drain(t0()).await.unwrap();
        assert_eq!(report.ready, 5);
        assert_eq!(report.sent, 2);
        assert_eq!(h.engine.queue().stats().unwrap().pending, 3);
    }

    #[tokio::test]
    async fn lowered_retry_budget_frees_the_recipient() {
        let h = harness(false, 2);
        let id = add_verified(&h, "a@x.io", daily_only());
        h.engine
            .settings()
            .update(
                SystemConfigPatch {
                    retry_attempts: Some(5),
                    ..Default::default()
                },
                t0(),
            )
            .unwrap();
        h.engine.fan_out(t0()).unwrap();
        assert_eq!(h.engine.drain(t0()).await.unwrap().retrying, 1);
        assert_eq!(h.engine.drain(t0()).await.unwrap().retrying, 1);

        h.engine
            .settings()
            .update(
                SystemConfigPatch {
                    retry_attempts: Some(2),
                    ..Default::default()
                },
                t0(),
            )
            .unwrap();
        let later = t0() + Duration::days(3);
        h.clock.set(later);

        let fan_out = h.engine.fan_out(later).unwrap();
        assert_eq!(fan_out.enqueued, 1);
        assert_eq!(fan_out.already_queued, 0);

        let jobs = h.engine.queue().list().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].attempts, 2);
        assert_eq!(jobs[1].status, JobStatus::Pending);

        let report = h.engine.drain(later).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(h.registry.get(&id).unwrap().unwrap().last_sent.daily, Some(later));
    }

    #[tokio::test]
    async fn drain_fails_exhausted_jobs_before_selecting_work() {
        let h = harness(false, 10);
        add_verified(&h, "a@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();
        h.engine.drain(t0()).await.unwrap();
        h.engine.drain(t0()).await.unwrap();

        h.engine
            .settings()
            .update(
                SystemConfigPatch {
                    retry_attempts: Some(1),
                    ..Default::default()
                },
                t0(),
            )
            .unwrap();
        let report = h.engine.drain(t0()).await.unwrap();
        assert_eq!(report.ready, 0);
        let stats = h.engine.queue().stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn each_attempt_is_stamped_with_its_own_time() {
        let h = harness_with_tick(false, 0, Duration::seconds(3));
        let first = add_verified(&h, "a@x.io", daily_only());
        let second = add_verified(&h, "b@x.io", daily_only());
        h.engine.fan_out(t0()).unwrap();

        let report = h.engine.drain(t0()).await.unwrap();
        assert_eq!(report.sent, 2);

        let jobs = h.engine.queue().list().unwrap();
        assert_eq!(jobs[0].last_attempt, Some(t0()));
        assert_eq!(jobs[1].last_attempt, Some(t0() + Duration::seconds(3)));
        assert_eq!(
            h.registry.get(&first).unwrap().unwrap().last_sent.daily,
            Some(t0())
        );
        assert_eq!(
            h.registry.get(&second).unwrap().unwrap().last_sent.daily,
            Some(t0() + Duration::seconds(3))
        );
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let h = harness(false, 0);
        let engine = Arc::new(h.engine);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&engine).run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
