use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use companion_core::{config::OrchestratorConfig, AdvisoryLock, Clock, KvStore};
use companion_scheduler::SchedulingEngine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    error::{OrchestratorError, Result},
    runs::RunLedger,
    types::{JobExecutionResult, LifecycleState, OrchestratorStats, RunConfig, SkipReason},
};

pub const JOB_LOCK_KEY: &str = "background_job_lock";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Run interval used until one is stored.
    pub run_interval_minutes: u32,
    /// Smallest accepted run interval.
    pub min_run_interval_minutes: u32,
    /// Recurring wake-up timer.
    pub tick_interval: std::time::Duration,
    /// Delay of the single follow-up check after going to the background.
    pub background_recheck: std::time::Duration,
    pub job_lock_ttl: Duration,
    pub history_limit: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for OrchestratorOptions {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            run_interval_minutes: cfg.run_interval_minutes,
            min_run_interval_minutes: companion_core::config::MIN_RUN_INTERVAL_MINUTES,
            tick_interval: std::time::Duration::from_secs(cfg.tick_interval_secs.max(1)),
            background_recheck: std::time::Duration::from_secs(cfg.background_recheck_secs),
            job_lock_ttl: Duration::seconds(cfg.job_lock_ttl_secs as i64),
            history_limit: cfg.history_limit,
        }
    }
}

/// Handles of the tasks spawned by `start`.
struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

enum PassOutcome {
    Skipped(SkipReason),
    Completed { emails_sent: usize, errors: Vec<String> },
}

/// Timer- and lifecycle-driven driver of full scheduling passes.
///
/// One instance per process. `start` spawns three tasks (the recurring timer,
/// the lifecycle listener and the engine's own drain loop); `stop` signals all
/// of them and waits for any in-flight pass to finish.
pub struct BackgroundOrchestrator {
    engine: Arc<SchedulingEngine>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    runs: RunLedger,
    job_lock: AdvisoryLock,
    opts: OrchestratorOptions,
    running: Mutex<Option<Running>>,
    /// Delayed background checks not yet finished.
    follow_ups: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundOrchestrator {
    pub fn new(
        engine: Arc<SchedulingEngine>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        opts: OrchestratorOptions,
    ) -> Self {
        Self {
            runs: RunLedger::new(
                Arc::clone(&store),
                opts.run_interval_minutes,
                opts.history_limit,
            ),
            job_lock: AdvisoryLock::new(JOB_LOCK_KEY, opts.job_lock_ttl),
            engine,
            store,
            clock,
            opts,
            running: Mutex::new(None),
            follow_ups: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &SchedulingEngine {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    /// Spawn the timer, the lifecycle listener and the engine drain loop.
    ///
    /// Returns `false` (and does nothing) if already started.
    pub fn start(self: &Arc<Self>, lifecycle: watch::Receiver<LifecycleState>) -> bool {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            warn!("orchestrator already running");
            return false;
        }

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Arc::clone(self).timer_loop(rx.clone())),
            tokio::spawn(Arc::clone(self).lifecycle_loop(lifecycle, rx.clone())),
            tokio::spawn(Arc::clone(&self.engine).run(rx)),
        ];
        *running = Some(Running { shutdown, tasks });
        info!(
            tick_secs = self.opts.tick_interval.as_secs(),
            "orchestrator started"
        );
        true
    }

    /// Signal every spawned task to stop and wait for them.
    ///
    /// A pass already in progress completes first.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        let Some(running) = running else {
            debug!("orchestrator not running");
            return;
        };
        let _ = running.shutdown.send(true);
        // the lifecycle listener is among these, so no follow-up spawns after
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("orchestrator task ended abnormally: {e}");
            }
        }
        let follow_ups = std::mem::take(&mut *self.follow_ups.lock().unwrap());
        for task in follow_ups {
            if let Err(e) = task.await {
                warn!("follow-up check ended abnormally: {e}");
            }
        }
        info!("orchestrator stopped");
    }

    /// Run a pass if enabled and due. `Ok(None)` means nothing was due.
    pub async fn check_and_run(&self) -> Result<Option<JobExecutionResult>> {
        let now = self.clock.now();
        let cfg = self.runs.get(now)?;
        if !cfg.enabled {
            debug!("background runs disabled");
            return Ok(None);
        }
        if !cfg.is_due(now) {
            debug!(
                next_run = ?cfg.next_run,
                last_run = ?cfg.last_run,
                "next pass not due yet"
            );
            return Ok(None);
        }
        self.execute_main_job().await.map(Some)
    }

    /// Bypass the interval gate.
    pub async fn force_run(&self) -> Result<JobExecutionResult> {
        info!("forced run requested");
        self.execute_main_job().await
    }

    /// One full pass (fan-out + drain) under the job lock.
    ///
    /// Fails with [`OrchestratorError::LockContention`], without touching any
    /// state, when another pass holds a live lock. Every other failure is
    /// folded into the returned result and the run record.
    pub async fn execute_main_job(&self) -> Result<JobExecutionResult> {
        let started = Instant::now();
        let now = self.clock.now();
        let Some(guard) = self.job_lock.try_acquire(self.store.as_ref(), now)? else {
            info!("pass skipped: job lock held");
            return Err(OrchestratorError::LockContention);
        };

        info!("scheduling pass started");
        let outcome = self.run_locked(now).await;
        let interval = self
            .runs
            .get(now)
            .map(|c| c.interval())
            .unwrap_or_else(|_| Duration::minutes(self.opts.run_interval_minutes as i64));
        let next_run = now + interval;

        let (success, skipped, emails_sent, errors) = match outcome {
            Ok(PassOutcome::Skipped(reason)) => {
                info!(%reason, "pass skipped");
                (false, Some(reason), 0, vec![reason.to_string()])
            }
            Ok(PassOutcome::Completed {
                emails_sent,
                errors,
            }) => {
                self.runs.update(now, |c| {
                    c.last_run = Some(now);
                    c.next_run = Some(next_run);
                    c.error_count = 0;
                    c.last_error = None;
                })?;
                info!(emails_sent, "scheduling pass complete");
                (errors.is_empty(), None, emails_sent, errors)
            }
            Err(e) => {
                let message = e.to_string();
                error!("scheduling pass failed: {message}");
                let cfg = self.runs.update(now, |c| {
                    c.error_count += 1;
                    c.last_error = Some(message.clone());
                    c.last_run = Some(now);
                    c.next_run = Some(next_run);
                })?;
                warn!(error_count = cfg.error_count, "run error recorded");
                (false, None, 0, vec![message])
            }
        };

        let result = JobExecutionResult {
            started_at: now,
            success,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
            emails_sent,
            errors,
            next_run_scheduled: next_run,
        };
        if let Err(e) = self.runs.record(&result) {
            warn!("could not record run history: {e}");
        }
        if let Err(e) = guard.release() {
            warn!("failed to release job lock: {e}");
        }
        Ok(result)
    }

    pub fn run_config(&self) -> Result<RunConfig> {
        self.runs.get(self.clock.now())
    }

    pub fn history(&self) -> Result<Vec<JobExecutionResult>> {
        self.runs.history()
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<RunConfig> {
        let cfg = self.runs.update(self.clock.now(), |c| c.enabled = enabled)?;
        info!(enabled, "background runs toggled");
        Ok(cfg)
    }

    /// Change the run interval. Values below the minimum are rejected.
    pub fn set_run_interval(&self, minutes: u32) -> Result<RunConfig> {
        if minutes < self.opts.min_run_interval_minutes {
            return Err(OrchestratorError::Validation(format!(
                "run interval must be at least {} minutes, got {minutes}",
                self.opts.min_run_interval_minutes
            )));
        }
        let now = self.clock.now();
        let cfg = self.runs.update(now, |c| {
            c.run_interval_minutes = minutes;
            c.next_run = Some(now + Duration::minutes(minutes as i64));
        })?;
        info!(minutes, "run interval updated");
        Ok(cfg)
    }

    /// Set `next_run` to the next occurrence of `hour:minute` in the
    /// configured local offset (tomorrow if already passed today).
    pub fn schedule_for_time(&self, hour: u32, minute: u32) -> Result<DateTime<Utc>> {
        let Some(at) = NaiveTime::from_hms_opt(hour, minute, 0) else {
            return Err(OrchestratorError::Validation(format!(
                "invalid time of day {hour:02}:{minute:02}"
            )));
        };
        let now = self.clock.now();
        let offset = self.engine.settings().get()?.offset();
        let local_now = now.with_timezone(&offset);
        let mut target = offset
            .from_local_datetime(&local_now.date_naive().and_time(at))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| OrchestratorError::Validation("unrepresentable local time".into()))?;
        if target <= now {
            target += Duration::days(1);
        }
        self.runs.update(now, |c| c.next_run = Some(target))?;
        info!(next_run = %target, "next pass scheduled");
        Ok(target)
    }

    pub fn stats(&self) -> Result<OrchestratorStats> {
        Ok(OrchestratorStats {
            run: self.run_config()?,
            is_running: self.is_running(),
            recipients: self.engine.registry().stats()?,
            queue: self.engine.queue().stats()?,
        })
    }

    // --- private helpers ---------------------------------------------------

    async fn run_locked(&self, now: DateTime<Utc>) -> Result<PassOutcome> {
        let system = self.engine.settings().get()?;
        if !system.enabled {
            return Ok(PassOutcome::Skipped(SkipReason::SystemDisabled));
        }

        let recipients = self.engine.registry().stats()?;
        if recipients.eligible == 0 {
            return Ok(PassOutcome::Skipped(SkipReason::NoEligibleRecipients));
        }
        debug!(eligible = recipients.eligible, "eligible recipients found");

        let sent_before = self.engine.queue().stats()?.sent;
        let (fan_out, drain) = self.engine.run_pass(now).await?;
        let sent_after = self.engine.queue().stats()?.sent;

        let mut errors = Vec::new();
        if drain.lock_held {
            errors.push("queue processing lock held; drain deferred".to_string());
        }
        if drain.errors > 0 {
            errors.push(format!("{} jobs hit store errors", drain.errors));
        }
        debug!(
            enqueued = fan_out.enqueued,
            attempted = drain.attempted,
            failed = drain.failed,
            "pass details"
        );
        Ok(PassOutcome::Completed {
            emails_sent: sent_after.saturating_sub(sent_before),
            errors,
        })
    }

    async fn tick(&self, trigger: &'static str) {
        match self.check_and_run().await {
            Ok(Some(result)) => debug!(trigger, success = result.success, "check ran a pass"),
            Ok(None) => {}
            Err(OrchestratorError::LockContention) => {
                info!(trigger, "check skipped: pass already running")
            }
            Err(e) => error!(trigger, "scheduled check failed: {e}"),
        }
    }

    async fn timer_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.opts.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick("timer").await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("timer loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn lifecycle_loop(
        self: Arc<Self>,
        mut lifecycle: watch::Receiver<LifecycleState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = lifecycle.changed() => {
                    if changed.is_err() {
                        debug!("lifecycle source closed");
                        break;
                    }
                    let state = *lifecycle.borrow_and_update();
                    info!(%state, "lifecycle transition");
                    match state {
                        LifecycleState::Foreground => self.tick("foreground").await,
                        LifecycleState::Background => {
                            self.schedule_background_check(lifecycle.clone(), shutdown.clone())
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("lifecycle listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One delayed check, run only if still in the background by then.
    fn schedule_background_check(
        self: &Arc<Self>,
        lifecycle: watch::Receiver<LifecycleState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let this = Arc::clone(self);
        let delay = self.opts.background_recheck;
        let handle = tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let still_background = *lifecycle.borrow() == LifecycleState::Background;
                    if still_background {
                        this.tick("background follow-up").await;
                    } else {
                        debug!("back in foreground; follow-up check dropped");
                    }
                }
                _ = shutdown.changed() => {}
            }
        });

        let mut follow_ups = self.follow_ups.lock().unwrap();
        follow_ups.retain(|h| !h.is_finished());
        follow_ups.push(handle);
    }
}
