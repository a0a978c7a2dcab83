//! Analysis run lifecycle.
//!
//! Each pass the manager discovers the analysis runs a rollout owns, keeps
//! or replaces the runs for the current step and for background analysis,
//! soft-cancels everything else and garbage-collects old completed runs.
//!
//! Run names are `<rollout>-step-<index>` and `<rollout>-background`. When
//! that name is held by a run that cannot be reused (terminating, or created
//! for another revision), the next free `-<n>` suffix is used.

use std::cmp::Ordering;

use thiserror::Error;
use tracing::{debug, info, warn};

use stride_state::{
    AnalysisPhase, AnalysisRun, AnalysisRunSpec, Argument, DryRun, Metric, ObjectMeta,
    ROLLOUT_PLUGIN_KIND, RolloutAnalysis, RolloutPlugin, RolloutPluginStatus, StateError,
    StateResult, StateStore, StepAction, object_key,
};

use crate::config::ControllerConfig;

pub const ANALYSIS_TYPE_LABEL: &str = "stride.dev/analysis-type";
pub const STEP_INDEX_LABEL: &str = "stride.dev/step-index";
pub const REVISION_LABEL: &str = "stride.dev/revision";
/// Sharding label, copied from the rollout onto the runs it spawns.
pub const CONTROLLER_INSTANCE_LABEL: &str = "stride.dev/controller-instance";

pub const STEP_ANALYSIS: &str = "step";
pub const BACKGROUND_ANALYSIS: &str = "background";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    State(#[from] StateError),

    /// The templates cannot be turned into a run. Recorded on the rollout.
    #[error("{0}")]
    Template(String),

    #[error("analysis run {0} exists and is not owned by this rollout")]
    NotOwned(String),
}

/// Runs chosen for the current pass.
#[derive(Debug, Default)]
pub struct AnalysisOutcome {
    pub step_run: Option<AnalysisRun>,
    pub background_run: Option<AnalysisRun>,
}

pub struct AnalysisManager<'a> {
    store: &'a StateStore,
    config: &'a ControllerConfig,
}

impl<'a> AnalysisManager<'a> {
    pub fn new(store: &'a StateStore, config: &'a ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Bring the rollout's analysis runs in line with its progress and record
    /// the current run names on `status`.
    pub fn reconcile(
        &self,
        rollout: &RolloutPlugin,
        status: &mut RolloutPluginStatus,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let discovered = self.discover(rollout, status)?;
        let (current_step, current_background, mut others) = classify(discovered.clone(), status);

        if !status.rollout_in_progress {
            others.extend(current_step);
            others.extend(current_background);
            status.current_step_analysis_run = None;
            status.current_background_analysis_run = None;
            self.cancel(&others)?;
            self.garbage_collect(&others)?;
            return Ok(AnalysisOutcome::default());
        }

        let index = status.current_step_index.unwrap_or(0);
        let steps = &rollout.spec.strategy.steps;

        let step_analysis = match steps.get(index as usize).map(|step| step.action()) {
            Some(StepAction::Analysis(analysis)) => Some(analysis),
            _ => None,
        };
        let index_label = index.to_string();
        let step_run = match step_analysis {
            Some(analysis) => {
                // A run recorded for another step index is not this step's run.
                let existing = match current_step {
                    Some(run)
                        if run.metadata.labels.get(STEP_INDEX_LABEL) == Some(&index_label) =>
                    {
                        Some(run)
                    }
                    stale => {
                        others.extend(stale);
                        None
                    }
                };
                match existing {
                    Some(run) if !needs_replacement(&run, status) => Some(run),
                    existing => {
                        let replacing = existing.as_ref().map(|run| run.metadata.name.clone());
                        if let Some(run) = existing {
                            others.push(run);
                        }
                        let base = format!("{}-step-{index}", rollout.metadata.name);
                        let name = choose_name(&base, &discovered, replacing.as_deref(), status);
                        let run = self.create_run(
                            rollout,
                            status,
                            analysis,
                            &name,
                            STEP_ANALYSIS,
                            Some(index),
                        )?;
                        Some(run)
                    }
                }
            }
            None => {
                others.extend(current_step);
                None
            }
        };

        let background = rollout
            .spec
            .strategy
            .analysis
            .as_ref()
            .filter(|bg| index >= bg.starting_step.unwrap_or(0));
        let background_run = match background {
            Some(background) => match current_background {
                Some(run) if !needs_replacement(&run, status) => Some(run),
                existing => {
                    let replacing = existing.as_ref().map(|run| run.metadata.name.clone());
                    if let Some(run) = existing {
                        others.push(run);
                    }
                    let base = format!("{}-background", rollout.metadata.name);
                    let name = choose_name(&base, &discovered, replacing.as_deref(), status);
                    let run = self.create_run(
                        rollout,
                        status,
                        &background.as_rollout_analysis(),
                        &name,
                        BACKGROUND_ANALYSIS,
                        None,
                    )?;
                    Some(run)
                }
            },
            None => {
                others.extend(current_background);
                None
            }
        };

        // A run adopted under its existing name must not be cancelled below.
        others.retain(|run| {
            let name = Some(&run.metadata.name);
            name != step_run.as_ref().map(|r| &r.metadata.name)
                && name != background_run.as_ref().map(|r| &r.metadata.name)
        });

        status.current_step_analysis_run = step_run.as_ref().map(|r| r.metadata.name.clone());
        status.current_background_analysis_run =
            background_run.as_ref().map(|r| r.metadata.name.clone());

        self.cancel(&others)?;
        self.garbage_collect(&others)?;

        Ok(AnalysisOutcome {
            step_run,
            background_run,
        })
    }

    /// Soft-cancel every run the rollout owns, so a new attempt never adopts
    /// a run left over from a discarded one.
    pub fn cancel_all(
        &self,
        rollout: &RolloutPlugin,
        status: &RolloutPluginStatus,
    ) -> StateResult<()> {
        let runs = self.discover(rollout, status)?;
        self.cancel(&runs)
    }

    /// Runs controlled by the rollout, plus any run the status names that the
    /// namespace listing missed.
    pub fn discover(
        &self,
        rollout: &RolloutPlugin,
        status: &RolloutPluginStatus,
    ) -> StateResult<Vec<AnalysisRun>> {
        let uid = &rollout.metadata.uid;
        let namespace = &rollout.metadata.namespace;
        let mut runs: Vec<AnalysisRun> = self
            .store
            .list_analysis_runs(namespace)?
            .into_iter()
            .filter(|run| run.metadata.is_controlled_by(uid))
            .collect();

        let referenced = [
            status.current_step_analysis_run.as_ref(),
            status.current_background_analysis_run.as_ref(),
        ];
        for name in referenced.into_iter().flatten() {
            if runs.iter().any(|run| &run.metadata.name == name) {
                continue;
            }
            if let Some(run) = self.store.get_analysis_run(namespace, name)?
                && run.metadata.is_controlled_by(uid)
            {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn create_run(
        &self,
        rollout: &RolloutPlugin,
        status: &RolloutPluginStatus,
        analysis: &RolloutAnalysis,
        name: &str,
        analysis_type: &str,
        step_index: Option<u32>,
    ) -> Result<AnalysisRun, AnalysisError> {
        let namespace = &rollout.metadata.namespace;
        let spec = self.resolve(namespace, analysis)?;

        let mut metadata = ObjectMeta::new(namespace, name);
        metadata
            .labels
            .insert(ANALYSIS_TYPE_LABEL.to_string(), analysis_type.to_string());
        if let Some(index) = step_index {
            metadata
                .labels
                .insert(STEP_INDEX_LABEL.to_string(), index.to_string());
        }
        if let Some(revision) = &status.updated_revision {
            metadata
                .labels
                .insert(REVISION_LABEL.to_string(), revision.clone());
        }
        if let Some(instance) = rollout.metadata.labels.get(CONTROLLER_INSTANCE_LABEL) {
            metadata
                .labels
                .insert(CONTROLLER_INSTANCE_LABEL.to_string(), instance.clone());
        }
        metadata.owner_references.push(rollout.owner_reference());

        let run = AnalysisRun {
            metadata,
            spec,
            status: None,
        };
        match self.store.create_analysis_run(&run) {
            Ok(created) => {
                info!(
                    rollout = %rollout.key(),
                    run = %name,
                    kind = analysis_type,
                    "analysis run created"
                );
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                let existing = self
                    .store
                    .get_analysis_run(namespace, name)?
                    .ok_or_else(|| StateError::NotFound(object_key(namespace, name)))?;
                if !existing.metadata.is_controlled_by(&rollout.metadata.uid) {
                    return Err(AnalysisError::NotOwned(name.to_string()));
                }
                debug!(rollout = %rollout.key(), run = %name, "analysis run exists, reusing");
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merge the referenced templates and the caller's arguments into a run spec.
    fn resolve(
        &self,
        namespace: &str,
        analysis: &RolloutAnalysis,
    ) -> Result<AnalysisRunSpec, AnalysisError> {
        let mut metrics: Vec<Metric> = Vec::new();
        let mut args: Vec<Argument> = Vec::new();
        let mut dry_run: Vec<DryRun> = Vec::new();

        for template in &analysis.templates {
            let name = &template.template_name;
            let spec = if template.cluster_scope {
                self.store
                    .get_cluster_analysis_template(name)?
                    .map(|t| t.spec)
                    .ok_or_else(|| {
                        AnalysisError::Template(format!(
                            "cluster analysis template {name} not found"
                        ))
                    })?
            } else {
                self.store
                    .get_analysis_template(namespace, name)?
                    .map(|t| t.spec)
                    .ok_or_else(|| {
                        AnalysisError::Template(format!(
                            "analysis template {} not found",
                            object_key(namespace, name)
                        ))
                    })?
            };

            for metric in spec.metrics {
                if metrics.iter().any(|m| m.name == metric.name) {
                    return Err(AnalysisError::Template(format!(
                        "metric {} is defined by more than one template",
                        metric.name
                    )));
                }
                metrics.push(metric);
            }
            for arg in spec.args {
                match args.iter_mut().find(|a| a.name == arg.name) {
                    None => args.push(arg),
                    Some(existing) => match (&existing.value, arg.value) {
                        (_, None) => {}
                        (None, value) => existing.value = value,
                        (Some(a), Some(b)) if *a == b => {}
                        (Some(_), Some(_)) => {
                            return Err(AnalysisError::Template(format!(
                                "templates give conflicting values for argument {}",
                                arg.name
                            )));
                        }
                    },
                }
            }
            for entry in spec.dry_run {
                if !dry_run.contains(&entry) {
                    dry_run.push(entry);
                }
            }
        }

        for arg in &analysis.args {
            match args.iter_mut().find(|a| a.name == arg.name) {
                Some(existing) => {
                    if arg.value.is_some() {
                        existing.value = arg.value.clone();
                    }
                }
                None => args.push(arg.clone()),
            }
        }
        if let Some(missing) = args.iter().find(|a| a.value.is_none()) {
            return Err(AnalysisError::Template(format!(
                "argument {} has no value",
                missing.name
            )));
        }

        Ok(AnalysisRunSpec {
            metrics,
            args,
            dry_run,
            terminate: false,
        })
    }

    /// Soft-cancel runs that are not already terminating.
    fn cancel(&self, runs: &[AnalysisRun]) -> StateResult<()> {
        for run in runs.iter().filter(|run| !run.is_terminating()) {
            let meta = &run.metadata;
            match self.store.terminate_analysis_run(&meta.namespace, &meta.name) {
                Ok(_) => debug!(run = %meta.table_key(), "analysis run terminated"),
                Err(StateError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn garbage_collect(&self, runs: &[AnalysisRun]) -> StateResult<()> {
        let doomed = runs_to_delete(
            runs,
            self.config.successful_run_history_limit,
            self.config.unsuccessful_run_history_limit,
        );
        for run in doomed {
            let meta = &run.metadata;
            if self.store.delete_analysis_run(&meta.namespace, &meta.name)? {
                debug!(run = %meta.table_key(), "old analysis run deleted");
            }
        }
        Ok(())
    }
}

/// Split discovered runs into (current step run, current background run, others)
/// using the names recorded on the status.
fn classify(
    runs: Vec<AnalysisRun>,
    status: &RolloutPluginStatus,
) -> (Option<AnalysisRun>, Option<AnalysisRun>, Vec<AnalysisRun>) {
    let mut step = None;
    let mut background = None;
    let mut others = Vec::new();
    for run in runs {
        let name = Some(&run.metadata.name);
        if step.is_none() && name == status.current_step_analysis_run.as_ref() {
            step = Some(run);
        } else if background.is_none() && name == status.current_background_analysis_run.as_ref() {
            background = Some(run);
        } else {
            others.push(run);
        }
    }
    (step, background, others)
}

/// Whether the current run must be replaced by a fresh one.
///
/// Failed and errored runs are kept so the step engine can abort on them.
fn needs_replacement(run: &AnalysisRun, status: &RolloutPluginStatus) -> bool {
    status.aborted || (status.paused && run.phase() == Some(&AnalysisPhase::Inconclusive))
}

/// First of `base`, `base-1`, `base-2`, ... that is free or held by a run
/// that can be adopted as-is.
fn choose_name(
    base: &str,
    discovered: &[AnalysisRun],
    replacing: Option<&str>,
    status: &RolloutPluginStatus,
) -> String {
    let usable = |candidate: &str| match discovered.iter().find(|r| r.metadata.name == candidate) {
        None => true,
        Some(run) => {
            Some(candidate) != replacing
                && !run.is_terminating()
                && run.metadata.labels.get(REVISION_LABEL) == status.updated_revision.as_ref()
        }
    };
    if usable(base) {
        return base.to_string();
    }
    (1u32..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| usable(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Completed runs beyond the history limits, oldest first within each class.
/// Runs still in flight are never selected.
pub fn runs_to_delete(
    runs: &[AnalysisRun],
    successful_limit: usize,
    unsuccessful_limit: usize,
) -> Vec<&AnalysisRun> {
    let mut completed: Vec<&AnalysisRun> = runs
        .iter()
        .filter(|run| run.phase().is_some_and(AnalysisPhase::is_completed))
        .collect();
    completed.sort_by(|a, b| newest_first(a, b));

    let mut successful = 0;
    let mut unsuccessful = 0;
    let mut doomed = Vec::new();
    for run in completed {
        if run.phase() == Some(&AnalysisPhase::Successful) {
            successful += 1;
            if successful > successful_limit {
                doomed.push(run);
            }
        } else {
            unsuccessful += 1;
            if unsuccessful > unsuccessful_limit {
                doomed.push(run);
            }
        }
    }
    doomed
}

fn newest_first(a: &AnalysisRun, b: &AnalysisRun) -> Ordering {
    b.metadata
        .creation_timestamp
        .cmp(&a.metadata.creation_timestamp)
        .then_with(|| b.metadata.name.cmp(&a.metadata.name))
}

/// Delete analysis runs whose controlling rollout no longer exists.
///
/// Returns the number of runs deleted.
pub fn sweep_orphaned_runs(store: &StateStore) -> StateResult<usize> {
    let live: Vec<String> = store
        .list_rollouts()?
        .into_iter()
        .map(|rollout| rollout.metadata.uid)
        .collect();
    let mut deleted = 0;
    for run in store.list_all_analysis_runs()? {
        let Some(owner) = run.metadata.controller() else {
            continue;
        };
        if owner.kind != ROLLOUT_PLUGIN_KIND || live.contains(&owner.uid) {
            continue;
        }
        let meta = &run.metadata;
        if store.delete_analysis_run(&meta.namespace, &meta.name)? {
            warn!(run = %meta.table_key(), owner = %owner.name, "orphaned analysis run deleted");
            deleted += 1;
        }
    }
    Ok(deleted)
}
