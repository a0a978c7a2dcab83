//! Status conditions: at most one per type, timestamps only move on change.

use chrono::{DateTime, Utc};

use stride_state::{Condition, ConditionStatus, ConditionType, RolloutPluginStatus};

pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_ROLLOUT_STARTED: &str = "RolloutStarted";
pub const REASON_STEP_COMPLETED: &str = "StepCompleted";
pub const REASON_NEW_REVISION: &str = "NewRevision";
pub const REASON_RESTARTED: &str = "RolloutRestarted";
pub const REASON_RESUMED: &str = "RolloutResumed";
pub const REASON_ABORTED: &str = "RolloutAborted";
pub const REASON_ANALYSIS_FAILED: &str = "AnalysisRunFailed";
pub const REASON_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";
pub const REASON_COMPLETED: &str = "RolloutCompleted";
pub const REASON_HEALTHY: &str = "RolloutHealthy";

pub fn get_condition(
    status: &RolloutPluginStatus,
    condition_type: ConditionType,
) -> Option<&Condition> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Set a condition. Returns whether anything changed.
///
/// An identical condition is left alone. A new reason or message bumps
/// `last_update_time`; `last_transition_time` moves only when the status
/// flips.
pub fn set_condition(
    status: &mut RolloutPluginStatus,
    condition_type: ConditionType,
    condition_status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    match status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing)
            if existing.status == condition_status
                && existing.reason == reason
                && existing.message == message =>
        {
            false
        }
        Some(existing) => {
            if existing.status != condition_status {
                existing.last_transition_time = now;
            }
            existing.status = condition_status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.last_update_time = now;
            true
        }
        None => {
            status.conditions.push(Condition {
                condition_type,
                status: condition_status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_update_time: now,
                last_transition_time: now,
            });
            true
        }
    }
}

/// Restamp a condition's `last_update_time` without changing it otherwise.
pub fn touch_condition(
    status: &mut RolloutPluginStatus,
    condition_type: ConditionType,
    now: DateTime<Utc>,
) {
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        existing.last_update_time = now;
    }
}

pub fn remove_condition(status: &mut RolloutPluginStatus, condition_type: ConditionType) -> bool {
    let before = status.conditions.len();
    status
        .conditions
        .retain(|c| c.condition_type != condition_type);
    status.conditions.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn identical_set_is_a_noop() {
        let mut status = RolloutPluginStatus::default();
        let healthy = |status: &mut RolloutPluginStatus, at| {
            set_condition(
                status,
                ConditionType::Healthy,
                ConditionStatus::True,
                REASON_HEALTHY,
                "ok",
                at,
            )
        };
        assert!(healthy(&mut status, t0()));
        assert!(!healthy(&mut status, t0() + Duration::minutes(5)));
        let c = get_condition(&status, ConditionType::Healthy).unwrap();
        assert_eq!(c.last_update_time, t0());
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn reason_change_bumps_update_time_only() {
        let mut status = RolloutPluginStatus::default();
        set_condition(
            &mut status,
            ConditionType::Progressing,
            ConditionStatus::True,
            REASON_ROLLOUT_STARTED,
            "started",
            t0(),
        );
        let later = t0() + Duration::seconds(30);
        let changed = set_condition(
            &mut status,
            ConditionType::Progressing,
            ConditionStatus::True,
            REASON_STEP_COMPLETED,
            "step 1/3",
            later,
        );
        assert!(changed);
        let c = get_condition(&status, ConditionType::Progressing).unwrap();
        assert_eq!(c.last_update_time, later);
        assert_eq!(c.last_transition_time, t0());
    }

    #[test]
    fn status_flip_bumps_both_times() {
        let mut status = RolloutPluginStatus::default();
        set_condition(
            &mut status,
            ConditionType::Progressing,
            ConditionStatus::True,
            REASON_ROLLOUT_STARTED,
            "",
            t0(),
        );
        let later = t0() + Duration::seconds(30);
        set_condition(
            &mut status,
            ConditionType::Progressing,
            ConditionStatus::False,
            REASON_ABORTED,
            "aborted",
            later,
        );
        let c = get_condition(&status, ConditionType::Progressing).unwrap();
        assert_eq!((c.last_update_time, c.last_transition_time), (later, later));
        assert_eq!(c.status, ConditionStatus::False);
    }

    #[test]
    fn remove_reports_presence() {
        let mut status = RolloutPluginStatus::default();
        assert!(!remove_condition(&mut status, ConditionType::Completed));
        set_condition(
            &mut status,
            ConditionType::Completed,
            ConditionStatus::True,
            REASON_COMPLETED,
            "",
            t0(),
        );
        assert!(remove_condition(&mut status, ConditionType::Completed));
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn touch_bumps_update_time_of_existing_condition() {
        let mut status = RolloutPluginStatus::default();
        touch_condition(&mut status, ConditionType::Progressing, t0());
        assert!(status.conditions.is_empty());

        set_condition(
            &mut status,
            ConditionType::Progressing,
            ConditionStatus::True,
            REASON_RESUMED,
            "rollout resumed",
            t0(),
        );
        let later = t0() + Duration::hours(1);
        touch_condition(&mut status, ConditionType::Progressing, later);
        let c = get_condition(&status, ConditionType::Progressing).unwrap();
        assert_eq!(c.last_update_time, later);
        assert_eq!(c.last_transition_time, t0());
    }
}
