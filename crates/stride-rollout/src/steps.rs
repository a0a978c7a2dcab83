//! Canary step engine.
//!
//! Executes the rollout's current step against the workload plugin and
//! decides whether to advance. Called only while a rollout is in progress,
//! with the analysis run the analysis manager chose for the current step.
//! All decisions are recorded on the draft status; the returned [`Action`]
//! tells the dispatcher when to look again.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use stride_plugin::ResourcePlugin;
use stride_state::{
    AnalysisPhase, AnalysisRun, ConditionStatus, ConditionType, RolloutPause, RolloutPlugin,
    RolloutPluginStatus, StepAction, WorkloadRef,
};

use crate::conditions::{self, REASON_ANALYSIS_FAILED};
use crate::config::ControllerConfig;
use crate::duration::parse_duration;
use crate::reconcile::Action;
use crate::status::{advance, clear_pause, complete, fail, pause, stop_progress};

/// Inputs for one step-engine pass.
pub struct StepContext<'a> {
    pub rollout: &'a RolloutPlugin,
    pub workload: &'a WorkloadRef,
    pub plugin: &'a dyn ResourcePlugin,
    /// Analysis run for the current step, if the manager has one.
    pub step_run: Option<&'a AnalysisRun>,
    pub config: &'a ControllerConfig,
    pub now: DateTime<Utc>,
}

/// Run the current step.
pub fn reconcile_steps(ctx: &StepContext<'_>, status: &mut RolloutPluginStatus) -> Action {
    let key = ctx.rollout.key();
    let steps = &ctx.rollout.spec.strategy.steps;

    if status.promote_full {
        info!(rollout = %key, "full promotion requested, skipping remaining steps");
        return promote(ctx, status);
    }

    let index = match status.current_step_index {
        Some(index) => index,
        None => {
            status.current_step_index = Some(0);
            0
        }
    };
    status.phase = Some(stride_state::RolloutPhase::Progressing);

    let Some(step) = steps.get(index as usize) else {
        debug!(rollout = %key, "all steps complete, promoting");
        return promote(ctx, status);
    };

    match step.action() {
        StepAction::SetWeight(weight) => set_weight(ctx, status, weight),
        StepAction::Analysis(_) => analysis_gate(ctx, status),
        StepAction::Pause(pause_step) => pause_gate(ctx, status, pause_step),
        StepAction::Empty => {
            debug!(rollout = %key, step = index, "step has no action");
            advance(status, steps, ctx.now)
        }
    }
}

fn promote(ctx: &StepContext<'_>, status: &mut RolloutPluginStatus) -> Action {
    match ctx.plugin.promote(ctx.workload) {
        Ok(()) => {
            info!(rollout = %ctx.rollout.key(), workload = %ctx.workload, "rollout promoted");
            complete(status, ctx.now);
        }
        Err(e) => {
            warn!(rollout = %ctx.rollout.key(), error = %e, "promote failed");
            fail(status, format!("promote failed: {e}"));
        }
    }
    Action::AwaitChange
}

fn set_weight(ctx: &StepContext<'_>, status: &mut RolloutPluginStatus, weight: u32) -> Action {
    let key = ctx.rollout.key();
    if let Err(e) = ctx.plugin.set_weight(ctx.workload, weight) {
        warn!(rollout = %key, weight, error = %e, "set weight failed");
        fail(status, format!("set weight {weight}% failed: {e}"));
        return Action::AwaitChange;
    }
    match ctx.plugin.verify_weight(ctx.workload, weight) {
        Ok(true) => {
            info!(rollout = %key, weight, "weight applied");
            advance(status, &ctx.rollout.spec.strategy.steps, ctx.now)
        }
        Ok(false) => {
            debug!(rollout = %key, weight, "weight not yet in effect");
            Action::RequeueAfter(ctx.config.weight_verify_interval())
        }
        Err(e) => {
            warn!(rollout = %key, weight, error = %e, "verify weight failed");
            fail(status, format!("verify weight {weight}% failed: {e}"));
            Action::AwaitChange
        }
    }
}

fn analysis_gate(ctx: &StepContext<'_>, status: &mut RolloutPluginStatus) -> Action {
    let key = ctx.rollout.key();
    let Some(run) = ctx.step_run else {
        debug!(rollout = %key, "step analysis run not created yet");
        return Action::RequeueAfter(ctx.config.analysis_pending_interval());
    };

    match run.phase() {
        Some(AnalysisPhase::Successful) => {
            info!(rollout = %key, run = %run.metadata.name, "step analysis succeeded");
            advance(status, &ctx.rollout.spec.strategy.steps, ctx.now)
        }
        Some(AnalysisPhase::Failed | AnalysisPhase::Error) => {
            abort_on_failed_analysis(ctx.rollout, ctx.plugin, ctx.workload, run, status, ctx.now)
        }
        Some(AnalysisPhase::Inconclusive) => {
            if !status.paused {
                info!(
                    rollout = %key,
                    run = %run.metadata.name,
                    "step analysis inconclusive, pausing"
                );
            }
            pause(status, ctx.now);
            status.message = format!(
                "analysis run {} was inconclusive; resume to retry",
                run.metadata.name
            );
            Action::AwaitChange
        }
        Some(AnalysisPhase::Unknown(phase)) => {
            status.message = format!(
                "analysis run {} reports unrecognized phase {phase}",
                run.metadata.name
            );
            Action::RequeueAfter(ctx.config.analysis_poll_interval())
        }
        Some(AnalysisPhase::Pending | AnalysisPhase::Running) | None => {
            // A pause left by an earlier inconclusive run no longer applies.
            if status.paused {
                clear_pause(status);
            }
            status.message = format!("waiting for analysis run {}", run.metadata.name);
            Action::RequeueAfter(ctx.config.analysis_poll_interval())
        }
    }
}

fn pause_gate(
    ctx: &StepContext<'_>,
    status: &mut RolloutPluginStatus,
    pause_step: &RolloutPause,
) -> Action {
    let duration = match pause_step.duration.as_deref().map(parse_duration).transpose() {
        Ok(duration) => duration,
        Err(e) => {
            warn!(rollout = %ctx.rollout.key(), error = %e, "bad pause duration");
            fail(status, format!("pause step has an {e}"));
            return Action::AwaitChange;
        }
    };

    let started = match status.pause_start_time.filter(|_| status.paused) {
        Some(started) => started,
        None => {
            pause(status, ctx.now);
            return match duration {
                Some(duration) => Action::RequeueAfter(duration),
                None => Action::AwaitChange,
            };
        }
    };

    let Some(duration) = duration else {
        return Action::AwaitChange;
    };
    let elapsed = (ctx.now - started).to_std().unwrap_or_default();
    if elapsed >= duration {
        debug!(rollout = %ctx.rollout.key(), ?duration, "pause elapsed");
        advance(status, &ctx.rollout.spec.strategy.steps, ctx.now)
    } else {
        Action::RequeueAfter(duration - elapsed)
    }
}

/// Abort the rollout because an analysis run failed.
///
/// If the plugin cannot abort, the rollout stays in progress and the next
/// pass tries again.
pub(crate) fn abort_on_failed_analysis(
    rollout: &RolloutPlugin,
    plugin: &dyn ResourcePlugin,
    workload: &WorkloadRef,
    run: &AnalysisRun,
    status: &mut RolloutPluginStatus,
    now: DateTime<Utc>,
) -> Action {
    let phase = run
        .phase()
        .map(ToString::to_string)
        .unwrap_or_else(|| "Unknown".to_string());
    let mut message = format!("analysis run {} {phase}", run.metadata.name);
    if let Some(detail) = run
        .status
        .as_ref()
        .map(|s| s.message.as_str())
        .filter(|m| !m.is_empty())
    {
        message = format!("{message}: {detail}");
    }

    if let Err(e) = plugin.abort(workload) {
        warn!(rollout = %rollout.key(), error = %e, "abort after failed analysis failed");
        fail(status, format!("{message}; abort failed: {e}"));
        return Action::AwaitChange;
    }

    warn!(
        rollout = %rollout.key(),
        run = %run.metadata.name,
        %phase,
        "analysis failed, rollout aborted"
    );
    status.aborted = true;
    status.aborted_revision = status.updated_revision.clone();
    stop_progress(status);
    fail(status, message.clone());
    conditions::set_condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::False,
        REASON_ANALYSIS_FAILED,
        &message,
        now,
    );
    Action::AwaitChange
}
