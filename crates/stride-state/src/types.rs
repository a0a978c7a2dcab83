//! Object types held by the Stride object store.
//!
//! The shapes follow the usual API-object layout: every object carries an
//! [`ObjectMeta`], a spec written by its author, and (for reconciled
//! objects) a status owned by a controller. All types round-trip through
//! JSON for storage in redb tables and for the REST API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind string recorded in owner references pointing at a rollout object.
pub const ROLLOUT_PLUGIN_KIND: &str = "RolloutPlugin";

/// Default progress deadline when the spec leaves it unset.
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: u32 = 600;

// ── Metadata ──────────────────────────────────────────────────────

/// Identity and bookkeeping shared by every stored object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    /// Empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: String,
    /// Bumped by the store whenever the spec changes.
    #[serde(default)]
    pub generation: i64,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a new namespaced object.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// The uid named by the controlling owner reference, if any.
    pub fn controller_uid(&self) -> Option<&str> {
        self.owner_references
            .iter()
            .find(|owner| owner.controller)
            .map(|owner| owner.uid.as_str())
    }

    /// The controlling owner reference, if any.
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|owner| owner.controller)
    }

    /// Whether the object is controlled by the object with the given uid.
    pub fn is_controlled_by(&self, uid: &str) -> bool {
        !uid.is_empty() && self.controller_uid() == Some(uid)
    }

    /// Composite table key: `{namespace}/{name}`, or `{name}` when cluster-scoped.
    pub fn table_key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

/// Build the table key for a (possibly cluster-scoped) object.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Reference from an owned object to its owner. Ownership is decided by
/// `uid`; `name` is informational.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

// ── RolloutPlugin ─────────────────────────────────────────────────

/// The reconciled object: drives one workload through canary steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutPlugin {
    pub metadata: ObjectMeta,
    pub spec: RolloutPluginSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RolloutPluginStatus>,
}

impl RolloutPlugin {
    /// Controller owner reference for objects spawned by this rollout.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: ROLLOUT_PLUGIN_KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: true,
        }
    }

    /// `{namespace}/{name}` of this rollout.
    pub fn key(&self) -> String {
        self.metadata.table_key()
    }
}

/// Author-controlled rollout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutPluginSpec {
    /// The workload being progressively updated.
    pub workload_ref: WorkloadRef,
    /// Name of the registered resource plugin that controls the workload.
    pub plugin: String,
    #[serde(default)]
    pub strategy: CanaryStrategy,
    /// Manual pause set by the author.
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub min_ready_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<u32>,
    /// Abort the rollout automatically when the progress deadline passes.
    #[serde(default)]
    pub progress_deadline_abort: bool,
}

impl RolloutPluginSpec {
    /// Progress deadline with the default applied.
    pub fn progress_deadline(&self) -> u32 {
        self.progress_deadline_seconds
            .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS)
    }
}

/// The (kind, name, namespace) triple identifying a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Ordered canary steps plus optional background analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CanaryStrategy {
    #[serde(default)]
    pub steps: Vec<CanaryStep>,
    /// Analysis that runs alongside the steps for the whole rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<BackgroundAnalysis>,
}

/// One unit of the strategy. Exactly one field is expected to be set; a step
/// with none set (for example one written for a newer controller) is a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CanaryStep {
    /// Percentage of traffic to send to the updated revision (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<RolloutAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<RolloutPause>,
}

/// The recognized action of a canary step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepAction<'a> {
    SetWeight(u32),
    Analysis(&'a RolloutAnalysis),
    Pause(&'a RolloutPause),
    Empty,
}

impl CanaryStep {
    pub fn set_weight(weight: u32) -> Self {
        Self {
            set_weight: Some(weight),
            ..Default::default()
        }
    }

    pub fn analysis(analysis: RolloutAnalysis) -> Self {
        Self {
            analysis: Some(analysis),
            ..Default::default()
        }
    }

    pub fn pause(duration: Option<&str>) -> Self {
        Self {
            pause: Some(RolloutPause {
                duration: duration.map(str::to_string),
            }),
            ..Default::default()
        }
    }

    /// The step's action, checked in set-weight, analysis, pause order.
    pub fn action(&self) -> StepAction<'_> {
        if let Some(weight) = self.set_weight {
            StepAction::SetWeight(weight)
        } else if let Some(analysis) = &self.analysis {
            StepAction::Analysis(analysis)
        } else if let Some(pause) = &self.pause {
            StepAction::Pause(pause)
        } else {
            StepAction::Empty
        }
    }

    /// Number of actions set on this step.
    pub fn action_count(&self) -> usize {
        usize::from(self.set_weight.is_some())
            + usize::from(self.analysis.is_some())
            + usize::from(self.pause.is_some())
    }
}

/// Pause step. An absent duration pauses until something external clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RolloutPause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// Analysis gate: templates to run and the arguments to feed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RolloutAnalysis {
    pub templates: Vec<AnalysisTemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
}

/// Analysis that runs for the duration of a rollout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackgroundAnalysis {
    pub templates: Vec<AnalysisTemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    /// Step index at which the background run is first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_step: Option<u32>,
}

impl BackgroundAnalysis {
    /// The gate shape shared with step analysis.
    pub fn as_rollout_analysis(&self) -> RolloutAnalysis {
        RolloutAnalysis {
            templates: self.templates.clone(),
            args: self.args.clone(),
        }
    }
}

/// Reference to an analysis template by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisTemplateRef {
    pub template_name: String,
    /// Resolve against cluster-scoped templates instead of the rollout's namespace.
    #[serde(default)]
    pub cluster_scope: bool,
}

/// Named argument passed to an analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Argument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Argument {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
        }
    }
}

/// Observed state of a rollout, written only by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RolloutPluginStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RolloutPhase>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_revision: Option<String>,

    #[serde(default)]
    pub rollout_in_progress: bool,
    /// Set iff `rollout_in_progress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<u32>,
    /// Every step has run and the rollout is waiting on promotion.
    #[serde(default)]
    pub current_step_complete: bool,

    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_revision: Option<String>,

    // One-shot control flags, set by operators and consumed by the controller.
    #[serde(default)]
    pub abort: bool,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub allow_restart: bool,
    #[serde(default)]
    pub promote_full: bool,

    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_analysis_run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_background_analysis_run: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// High-level rollout phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutPhase {
    Progressing,
    Paused,
    Successful,
    Failed,
    Degraded,
    Healthy,
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A status condition; at most one per type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_update_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    InvalidSpec,
    Progressing,
    Completed,
    Healthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

// ── Analysis ──────────────────────────────────────────────────────

/// One execution of a metric-based gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRun {
    pub metadata: ObjectMeta,
    pub spec: AnalysisRunSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AnalysisRunStatus>,
}

impl AnalysisRun {
    /// The run's phase; `None` until the executor has written a status.
    pub fn phase(&self) -> Option<&AnalysisPhase> {
        self.status.as_ref().and_then(|status| status.phase.as_ref())
    }

    /// Whether the run has been asked to stop.
    pub fn is_terminating(&self) -> bool {
        self.spec.terminate
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRunSpec {
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dry_run: Vec<DryRun>,
    /// Soft-cancel flag; the executor stops measuring once set.
    #[serde(default)]
    pub terminate: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRunStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<AnalysisPhase>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Phase of an analysis run. Unknown strings survive a round-trip so a
/// controller older than the executor can still report them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AnalysisPhase {
    Pending,
    Running,
    Successful,
    Failed,
    Error,
    Inconclusive,
    Unknown(String),
}

impl AnalysisPhase {
    /// Whether the run has reached a final phase.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Error | Self::Inconclusive
        )
    }
}

impl From<String> for AnalysisPhase {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Successful" => Self::Successful,
            "Failed" => Self::Failed,
            "Error" => Self::Error,
            "Inconclusive" => Self::Inconclusive,
            _ => Self::Unknown(value),
        }
    }
}

impl From<AnalysisPhase> for String {
    fn from(phase: AnalysisPhase) -> Self {
        match phase {
            AnalysisPhase::Pending => "Pending".to_string(),
            AnalysisPhase::Running => "Running".to_string(),
            AnalysisPhase::Successful => "Successful".to_string(),
            AnalysisPhase::Failed => "Failed".to_string(),
            AnalysisPhase::Error => "Error".to_string(),
            AnalysisPhase::Inconclusive => "Inconclusive".to_string(),
            AnalysisPhase::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// A metric measured by an analysis run. The provider block is opaque to the
/// controller and is handed through to the executor unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub provider: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_condition: Option<String>,
}

/// Metric evaluated without affecting the run's outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DryRun {
    pub metric_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisTemplateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dry_run: Vec<DryRun>,
}

/// Namespace-scoped analysis template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisTemplate {
    pub metadata: ObjectMeta,
    pub spec: AnalysisTemplateSpec,
}

/// Cluster-scoped analysis template (empty namespace).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterAnalysisTemplate {
    pub metadata: ObjectMeta,
    pub spec: AnalysisTemplateSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_action_prefers_first_set_field() {
        assert_eq!(CanaryStep::set_weight(30).action(), StepAction::SetWeight(30));
        assert_eq!(CanaryStep::default().action(), StepAction::Empty);
        let pause = CanaryStep::pause(Some("30s"));
        assert!(matches!(
            pause.action(),
            StepAction::Pause(p) if p.duration.as_deref() == Some("30s")
        ));
    }

    #[test]
    fn unknown_step_fields_deserialize_as_empty_step() {
        let raw = r#"{"set_header_route": {"name": "x"}}"#;
        let step: CanaryStep = serde_json::from_str(raw).unwrap();
        assert_eq!(step.action(), StepAction::Empty);
        assert_eq!(step.action_count(), 0);
    }

    #[test]
    fn analysis_phase_keeps_unknown_values() {
        let phase: AnalysisPhase = serde_json::from_str(r#""Paused""#).unwrap();
        assert_eq!(phase, AnalysisPhase::Unknown("Paused".to_string()));
        assert_eq!(serde_json::to_string(&phase).unwrap(), r#""Paused""#);

        let phase: AnalysisPhase = serde_json::from_str(r#""Inconclusive""#).unwrap();
        assert_eq!(phase, AnalysisPhase::Inconclusive);
        assert!(phase.is_completed());
        assert!(!AnalysisPhase::Running.is_completed());
    }

    #[test]
    fn ownership_is_decided_by_uid() {
        let mut meta = ObjectMeta::new("prod", "api-step-0");
        meta.owner_references.push(OwnerReference {
            kind: ROLLOUT_PLUGIN_KIND.to_string(),
            name: "renamed".to_string(),
            uid: "uid-1".to_string(),
            controller: true,
        });
        assert!(meta.is_controlled_by("uid-1"));
        assert!(!meta.is_controlled_by("uid-2"));
        assert!(!meta.is_controlled_by(""));
    }

    #[test]
    fn cluster_scoped_key_has_no_namespace() {
        assert_eq!(object_key("", "error-rate"), "error-rate");
        assert_eq!(object_key("prod", "api"), "prod/api");
    }

    #[test]
    fn progress_deadline_defaults() {
        let spec = RolloutPluginSpec {
            workload_ref: WorkloadRef::default(),
            plugin: "statefulset".to_string(),
            strategy: CanaryStrategy::default(),
            paused: false,
            min_ready_seconds: 0,
            progress_deadline_seconds: None,
            progress_deadline_abort: false,
        };
        assert_eq!(spec.progress_deadline(), DEFAULT_PROGRESS_DEADLINE_SECONDS);
    }
}
