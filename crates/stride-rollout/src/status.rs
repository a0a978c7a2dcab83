//! Small mutations of a draft rollout status shared by the orchestrator and
//! the step engine.

use chrono::{DateTime, Utc};

use stride_state::{
    CanaryStep, ConditionStatus, ConditionType, RolloutPhase, RolloutPluginStatus, StepAction,
};

use crate::conditions::{self, REASON_COMPLETED, REASON_STEP_COMPLETED};
use crate::reconcile::Action;

pub(crate) fn fail(status: &mut RolloutPluginStatus, message: impl Into<String>) {
    status.phase = Some(RolloutPhase::Failed);
    status.message = message.into();
}

pub(crate) fn pause(status: &mut RolloutPluginStatus, now: DateTime<Utc>) {
    if !status.paused || status.pause_start_time.is_none() {
        status.paused = true;
        status.pause_start_time = Some(now);
    }
}

pub(crate) fn clear_pause(status: &mut RolloutPluginStatus) {
    status.paused = false;
    status.pause_start_time = None;
}

pub(crate) fn clear_analysis_refs(status: &mut RolloutPluginStatus) {
    status.current_step_analysis_run = None;
    status.current_background_analysis_run = None;
}

/// Leave the in-progress state entirely.
pub(crate) fn stop_progress(status: &mut RolloutPluginStatus) {
    status.rollout_in_progress = false;
    status.current_step_index = None;
    status.current_step_complete = false;
    clear_pause(status);
}

/// Put the rollout back at step 0.
pub(crate) fn reset_progress(status: &mut RolloutPluginStatus) {
    status.rollout_in_progress = true;
    status.current_step_index = Some(0);
    status.current_step_complete = false;
    clear_pause(status);
    clear_analysis_refs(status);
}

/// Move past the current step. A following pause step is armed in the same
/// write so the pause clock starts when the previous step finished.
pub(crate) fn advance(
    status: &mut RolloutPluginStatus,
    steps: &[CanaryStep],
    now: DateTime<Utc>,
) -> Action {
    let next = status.current_step_index.map_or(0, |index| index + 1);
    status.current_step_index = Some(next);
    status.current_step_complete = next as usize >= steps.len();
    clear_pause(status);
    status.phase = Some(RolloutPhase::Progressing);
    status.message = if status.current_step_complete {
        "all steps complete".to_string()
    } else {
        format!("step {next}/{}", steps.len())
    };
    let message = status.message.clone();
    conditions::set_condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::True,
        REASON_STEP_COMPLETED,
        &message,
        now,
    );

    match steps.get(next as usize).map(CanaryStep::action) {
        Some(StepAction::Pause(_)) => {
            pause(status, now);
            Action::AwaitChange
        }
        _ => Action::RequeueNow,
    }
}

/// The workload is fully on the updated revision.
pub(crate) fn complete(status: &mut RolloutPluginStatus, now: DateTime<Utc>) {
    stop_progress(status);
    status.promote_full = false;
    clear_analysis_refs(status);
    status.phase = Some(RolloutPhase::Successful);
    status.message = match &status.updated_revision {
        Some(revision) => format!("revision {revision} promoted"),
        None => "rollout promoted".to_string(),
    };
    let message = status.message.clone();
    conditions::remove_condition(status, ConditionType::Progressing);
    conditions::set_condition(
        status,
        ConditionType::Completed,
        ConditionStatus::True,
        REASON_COMPLETED,
        &message,
        now,
    );
}
