use chrono::{DateTime, Duration, Utc};
use companion_recipients::RecipientStats;
use companion_scheduler::QueueStats;
use serde::{Deserialize, Serialize};

/// Runtime lifecycle signal consumed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Foreground,
    Background,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Foreground => write!(f, "foreground"),
            LifecycleState::Background => write!(f, "background"),
        }
    }
}

/// Why a pass ended without doing any work. Not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SystemDisabled,
    NoEligibleRecipients,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SystemDisabled => write!(f, "email system disabled"),
            SkipReason::NoEligibleRecipients => write!(f, "no eligible recipients"),
        }
    }
}

/// Singleton record driving the orchestrator's state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    #[serde(alias = "runInterval")]
    pub run_interval_minutes: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl RunConfig {
    pub fn new(run_interval_minutes: u32, now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            last_run: None,
            next_run: Some(now + Duration::minutes(run_interval_minutes as i64)),
            run_interval_minutes,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(self.run_interval_minutes as i64)
    }

    /// Never ran, the interval has elapsed since `last_run`, or an explicitly
    /// scheduled `next_run` has been reached.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => {
                now - last >= self.interval() || self.next_run.is_some_and(|next| now >= next)
            }
        }
    }
}

/// Outcome of one `execute_main_job` call, also kept in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionResult {
    pub started_at: DateTime<Utc>,
    /// No errors. A skipped pass is not successful but is not counted as an error either.
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    pub duration_ms: u64,
    pub emails_sent: usize,
    pub errors: Vec<String>,
    pub next_run_scheduled: DateTime<Utc>,
}

/// Combined view for the configuration surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub run: RunConfig,
    pub is_running: bool,
    pub recipients: RecipientStats,
    pub queue: QueueStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn due_after_interval() {
        let mut cfg = RunConfig::new(60, t0());
        assert!(cfg.is_due(t0()));

        cfg.last_run = Some(t0());
        cfg.next_run = Some(t0() + Duration::minutes(60));
        assert!(!cfg.is_due(t0() + Duration::minutes(59)));
        assert!(cfg.is_due(t0() + Duration::minutes(60)));
    }

    #[test]
    fn scheduled_next_run_brings_pass_forward() {
        let mut cfg = RunConfig::new(60, t0());
        cfg.last_run = Some(t0());
        cfg.next_run = Some(t0() + Duration::minutes(20));
        assert!(cfg.is_due(t0() + Duration::minutes(20)));
    }

    #[test]
    fn accepts_legacy_interval_field() {
        let cfg: RunConfig = serde_json::from_str(
            r#"{"enabled":true,"lastRun":null,"nextRun":null,"runInterval":90,"errorCount":2,"lastError":"x"}"#,
        )
        .unwrap();
        assert_eq!(cfg.run_interval_minutes, 90);
        assert_eq!(cfg.error_count, 2);
    }
}
