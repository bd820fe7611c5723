//! Job schedules, overridable through `WORKER_*` environment variables

use thiserror::Error;

#[derive(Debug, Error)]
#[error("{key} must be a six-field cron expression, got '{value}'")]
pub struct ScheduleError {
    pub key: &'static str,
    pub value: String,
}

/// Cron expressions (sec min hour day month weekday), UTC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSchedule {
    /// Monthly earnings rollover, shortly after midnight on the 1st
    pub earnings_rollover: String,
    pub invariant_checks: String,
    pub claim_recovery: String,
    pub heartbeat: String,
}

impl Default for WorkerSchedule {
    fn default() -> Self {
        Self {
            earnings_rollover: "0 5 0 1 * *".to_string(),
            invariant_checks: "0 0 * * * *".to_string(),
            claim_recovery: "0 */15 * * * *".to_string(),
            heartbeat: "0 */5 * * * *".to_string(),
        }
    }
}

impl WorkerSchedule {
    pub fn from_env() -> Result<Self, ScheduleError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ScheduleError> {
        let defaults = Self::default();
        let pick = |key: &'static str, default: String| -> Result<String, ScheduleError> {
            match lookup(key).map(|v| v.trim().to_string()) {
                Some(value) if !value.is_empty() => {
                    if value.split_whitespace().count() != 6 {
                        return Err(ScheduleError { key, value });
                    }
                    Ok(value)
                }
                _ => Ok(default),
            }
        };

        Ok(Self {
            earnings_rollover: pick("WORKER_EARNINGS_ROLLOVER_CRON", defaults.earnings_rollover)?,
            invariant_checks: pick("WORKER_INVARIANT_CHECKS_CRON", defaults.invariant_checks)?,
            claim_recovery: pick("WORKER_CLAIM_RECOVERY_CRON", defaults.claim_recovery)?,
            heartbeat: pick("WORKER_HEARTBEAT_CRON", defaults.heartbeat)?,
        })
    }
}
