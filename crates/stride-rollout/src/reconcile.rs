//! Reconciliation orchestrator.
//!
//! One pass reads a rollout, recomputes its status from the rollout, the
//! workload and its analysis runs, and writes the status back once. Passes
//! are level-triggered: running a pass twice against unchanged inputs
//! produces the same status and the second write is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use stride_plugin::{PluginRegistry, ResourcePlugin, WorkloadStatus};
use stride_state::{
    AnalysisPhase, ConditionStatus, ConditionType, RolloutPhase, RolloutPlugin,
    RolloutPluginStatus, StateStore, StepAction, WorkloadRef, object_key,
};

use crate::analysis::{AnalysisError, AnalysisManager};
use crate::clock::Clock;
use crate::conditions::{
    self, REASON_ABORTED, REASON_DEADLINE_EXCEEDED, REASON_HEALTHY, REASON_INVALID_SPEC,
    REASON_NEW_REVISION, REASON_RESTARTED, REASON_RESUMED, REASON_ROLLOUT_STARTED,
};
use crate::config::ControllerConfig;
use crate::error::ReconcileResult;
use crate::status::{clear_analysis_refs, clear_pause, fail, pause, reset_progress, stop_progress};
use crate::steps::{StepContext, abort_on_failed_analysis, reconcile_steps};
use crate::validation::validate_spec;

/// What the dispatcher should do with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the rollout or one of its runs changes.
    AwaitChange,
    RequeueNow,
    RequeueAfter(Duration),
}

pub struct Reconciler {
    store: StateStore,
    registry: Arc<PluginRegistry>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: StateStore,
        registry: Arc<PluginRegistry>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run one pass for the rollout `namespace/name`.
    ///
    /// Errors are store failures, including a lost optimistic-concurrency
    /// race on the status write; the caller retries the key. A deleted
    /// rollout is not an error: its analysis runs are left for the orphan
    /// sweep.
    pub fn reconcile(&self, namespace: &str, name: &str) -> ReconcileResult<Action> {
        let Some(rollout) = self.store.get_rollout(namespace, name)? else {
            debug!(rollout = %object_key(namespace, name), "rollout gone, nothing to reconcile");
            return Ok(Action::AwaitChange);
        };

        let now = self.clock.now();
        let mut draft = rollout.status.clone().unwrap_or_default();
        let action = self.reconcile_status(&rollout, &mut draft, now)?;
        draft.observed_generation = rollout.metadata.generation;

        self.store.update_rollout_status(
            namespace,
            name,
            rollout.metadata.resource_version,
            &draft,
        )?;
        debug!(rollout = %rollout.key(), phase = ?draft.phase, ?action, "reconciled");
        Ok(action)
    }

    fn reconcile_status(
        &self,
        rollout: &RolloutPlugin,
        status: &mut RolloutPluginStatus,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Action> {
        let key = rollout.key();
        let spec = &rollout.spec;

        if let Err(reason) = validate_spec(spec) {
            warn!(rollout = %key, %reason, "invalid rollout spec");
            conditions::set_condition(
                status,
                ConditionType::InvalidSpec,
                ConditionStatus::True,
                REASON_INVALID_SPEC,
                &reason,
                now,
            );
            fail(status, format!("invalid spec: {reason}"));
            return Ok(Action::AwaitChange);
        }
        conditions::remove_condition(status, ConditionType::InvalidSpec);

        let plugin = match self.registry.get(&spec.plugin) {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!(
                    rollout = %key,
                    plugin = %spec.plugin,
                    error = %e,
                    "resource plugin unavailable"
                );
                fail(status, format!("resource plugin {}: {e}", spec.plugin));
                return Ok(Action::AwaitChange);
            }
        };
        let plugin = plugin.as_ref();
        let workload = workload_ref(rollout);

        if status.restart {
            let attempts = status.restart_count;
            let action = restart(&key, plugin, &workload, status, now);
            if status.restart_count != attempts {
                AnalysisManager::new(&self.store, &self.config).cancel_all(rollout, status)?;
            }
            return Ok(action);
        }

        if spec.paused {
            if status.phase != Some(RolloutPhase::Paused) {
                info!(rollout = %key, "rollout paused");
            }
            pause(status, now);
            status.phase = Some(RolloutPhase::Paused);
            status.message = "rollout paused".to_string();
            return Ok(Action::AwaitChange);
        }
        if status.paused && resumed_from_manual_pause(rollout, status) {
            info!(rollout = %key, "rollout resumed");
            clear_pause(status);
            if status.rollout_in_progress {
                // Time spent paused by hand does not count against the deadline.
                conditions::set_condition(
                    status,
                    ConditionType::Progressing,
                    ConditionStatus::True,
                    REASON_RESUMED,
                    "rollout resumed",
                    now,
                );
                conditions::touch_condition(status, ConditionType::Progressing, now);
            }
        }

        if status.abort {
            return Ok(abort(
                &key,
                plugin,
                &workload,
                status,
                now,
                REASON_ABORTED,
                "rollout aborted on request",
            ));
        }

        if status.rollout_in_progress
            && !status.paused
            && let Some(action) = self.check_deadline(rollout, plugin, &workload, status, now)
        {
            return Ok(action);
        }

        let observed = match plugin.get_status(&workload) {
            Ok(observed) => observed,
            Err(e) => {
                warn!(rollout = %key, %workload, error = %e, "workload status unavailable");
                fail(status, format!("failed to read workload {workload}: {e}"));
                return Ok(Action::AwaitChange);
            }
        };
        observe_workload(&key, status, &observed, now);

        // Available lagging ready means pods are still inside their
        // min-ready window.
        if spec.min_ready_seconds > 0 && observed.available_replicas != observed.ready_replicas {
            debug!(rollout = %key, "waiting for replicas to become available");
            return Ok(Action::RequeueAfter(self.config.min_ready_interval()));
        }

        if observed.current_revision != observed.updated_revision && !status.rollout_in_progress {
            let revision = observed.updated_revision.as_str();
            let blocked = status.aborted_revision.as_deref() == Some(revision);
            if blocked && !status.allow_restart {
                status.message = format!(
                    "revision {revision} was aborted; set allow-restart to roll it out again"
                );
            } else {
                if blocked {
                    info!(rollout = %key, %revision, "restart of aborted revision allowed");
                    status.allow_restart = false;
                    status.aborted = false;
                    status.aborted_revision = None;
                }
                start_rollout(&key, status, revision, now);
            }
        }

        let manager = AnalysisManager::new(&self.store, &self.config);
        let outcome = match manager.reconcile(rollout, status) {
            Ok(outcome) => outcome,
            Err(AnalysisError::State(e)) => return Err(e.into()),
            Err(e) => {
                warn!(rollout = %key, error = %e, "analysis run could not be created");
                fail(status, e.to_string());
                return Ok(Action::AwaitChange);
            }
        };

        if status.rollout_in_progress {
            if let Some(run) = outcome
                .background_run
                .as_ref()
                .filter(|run| {
                    matches!(run.phase(), Some(AnalysisPhase::Failed | AnalysisPhase::Error))
                })
            {
                return Ok(abort_on_failed_analysis(rollout, plugin, &workload, run, status, now));
            }
            let ctx = StepContext {
                rollout,
                workload: &workload,
                plugin,
                step_run: outcome.step_run.as_ref(),
                config: &self.config,
                now,
            };
            return Ok(reconcile_steps(&ctx, status));
        }

        status.promote_full = false;
        if !status.aborted {
            status.phase = Some(RolloutPhase::Healthy);
            status.message = format!("revision {} is stable", observed.current_revision);
            let message = status.message.clone();
            conditions::set_condition(
                status,
                ConditionType::Healthy,
                ConditionStatus::True,
                REASON_HEALTHY,
                &message,
                now,
            );
        }
        Ok(Action::AwaitChange)
    }

    /// Flag a rollout that has stopped making progress. Returns an action
    /// only when the pass must end here.
    fn check_deadline(
        &self,
        rollout: &RolloutPlugin,
        plugin: &dyn ResourcePlugin,
        workload: &WorkloadRef,
        status: &mut RolloutPluginStatus,
        now: DateTime<Utc>,
    ) -> Option<Action> {
        let last_progress = conditions::get_condition(status, ConditionType::Progressing)
            .filter(|c| c.status == ConditionStatus::True)?
            .last_update_time;
        let deadline = rollout.spec.progress_deadline();
        if now - last_progress <= chrono::Duration::seconds(i64::from(deadline)) {
            return None;
        }

        let message = format!("rollout made no progress for {deadline}s");
        warn!(rollout = %rollout.key(), deadline, "progress deadline exceeded");
        if rollout.spec.progress_deadline_abort {
            return Some(abort(
                &rollout.key(),
                plugin,
                workload,
                status,
                now,
                REASON_DEADLINE_EXCEEDED,
                &message,
            ));
        }
        conditions::set_condition(
            status,
            ConditionType::Progressing,
            ConditionStatus::False,
            REASON_DEADLINE_EXCEEDED,
            &message,
            now,
        );
        status.message = message;
        None
    }
}

/// The workload reference, defaulting its namespace to the rollout's.
fn workload_ref(rollout: &RolloutPlugin) -> WorkloadRef {
    let mut workload = rollout.spec.workload_ref.clone();
    if workload.namespace.is_empty() {
        workload.namespace = rollout.metadata.namespace.clone();
    }
    workload
}

/// Whether a pause on the status was left by a manual pause that has since
/// been lifted. Pauses owned by a pause step stay in place.
fn resumed_from_manual_pause(rollout: &RolloutPlugin, status: &RolloutPluginStatus) -> bool {
    let Some(index) = status.current_step_index else {
        return true;
    };
    let on_pause_step = matches!(
        rollout
            .spec
            .strategy
            .steps
            .get(index as usize)
            .map(|step| step.action()),
        Some(StepAction::Pause(_))
    );
    status.phase == Some(RolloutPhase::Paused) && !on_pause_step
}

fn observe_workload(
    key: &str,
    status: &mut RolloutPluginStatus,
    observed: &WorkloadStatus,
    now: DateTime<Utc>,
) {
    status.replicas = observed.replicas;
    status.updated_replicas = observed.updated_replicas;
    status.ready_replicas = observed.ready_replicas;
    status.available_replicas = observed.available_replicas;
    status.current_revision = Some(observed.current_revision.clone());

    let revision = observed.updated_revision.as_str();
    if status.updated_revision.as_deref() == Some(revision) {
        return;
    }
    info!(rollout = %key, %revision, "new workload revision observed");
    status.updated_revision = Some(revision.to_string());
    if status.aborted_revision.as_deref() != Some(revision) {
        status.aborted = false;
        status.aborted_revision = None;
    }
    status.restart_count = 0;
    status.restarted_at = None;

    // A revision change mid-rollout starts the steps over.
    if status.rollout_in_progress {
        reset_progress(status);
        status.phase = Some(RolloutPhase::Progressing);
        status.message = format!("revision {revision} replaced the revision being rolled out");
        let message = status.message.clone();
        conditions::set_condition(
            status,
            ConditionType::Progressing,
            ConditionStatus::True,
            REASON_NEW_REVISION,
            &message,
            now,
        );
    }
}

fn start_rollout(key: &str, status: &mut RolloutPluginStatus, revision: &str, now: DateTime<Utc>) {
    info!(rollout = %key, %revision, "rollout started");
    reset_progress(status);
    status.phase = Some(RolloutPhase::Progressing);
    status.message = format!("rolling out revision {revision}");
    let message = status.message.clone();
    conditions::remove_condition(status, ConditionType::Completed);
    conditions::remove_condition(status, ConditionType::Healthy);
    conditions::set_condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::True,
        REASON_ROLLOUT_STARTED,
        &message,
        now,
    );
}

fn abort(
    key: &str,
    plugin: &dyn ResourcePlugin,
    workload: &WorkloadRef,
    status: &mut RolloutPluginStatus,
    now: DateTime<Utc>,
    reason: &str,
    message: &str,
) -> Action {
    if let Err(e) = plugin.abort(workload) {
        warn!(rollout = %key, error = %e, "abort failed");
        fail(status, format!("abort failed: {e}"));
        return Action::AwaitChange;
    }
    warn!(rollout = %key, %reason, "rollout aborted");
    status.abort = false;
    status.aborted = true;
    status.aborted_revision = status.updated_revision.clone();
    stop_progress(status);
    clear_analysis_refs(status);
    status.phase = Some(RolloutPhase::Degraded);
    status.message = message.to_string();
    conditions::set_condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::False,
        reason,
        message,
        now,
    );
    Action::AwaitChange
}

/// Re-run an aborted rollout from step 0. The request flag is consumed
/// whatever the outcome.
fn restart(
    key: &str,
    plugin: &dyn ResourcePlugin,
    workload: &WorkloadRef,
    status: &mut RolloutPluginStatus,
    now: DateTime<Utc>,
) -> Action {
    status.restart = false;
    if !status.aborted {
        warn!(rollout = %key, "restart requested for a rollout that is not aborted");
        fail(
            status,
            "restart requested but the rollout is not aborted; \
             only an aborted rollout can be restarted",
        );
        return Action::AwaitChange;
    }
    if let Err(e) = plugin.restart(workload) {
        warn!(rollout = %key, error = %e, "restart failed");
        fail(status, format!("restart failed: {e}"));
        return Action::AwaitChange;
    }

    status.restart_count += 1;
    status.restarted_at = Some(now);
    status.aborted = false;
    status.aborted_revision = None;
    status.allow_restart = false;
    reset_progress(status);
    status.phase = Some(RolloutPhase::Progressing);
    status.message = format!("rollout restarted (attempt {})", status.restart_count);
    let message = status.message.clone();
    conditions::set_condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::True,
        REASON_RESTARTED,
        &message,
        now,
    );
    info!(rollout = %key, attempt = status.restart_count, "rollout restarted");
    Action::RequeueNow
}
