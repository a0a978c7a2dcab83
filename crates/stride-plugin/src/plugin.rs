//! The workload-control capability consumed by the rollout controller.

use serde::{Deserialize, Serialize};

use stride_state::WorkloadRef;

use crate::error::PluginResult;

/// Live status of a workload as reported by its plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub replicas: i32,
    pub updated_replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    /// Revision currently serving the stable traffic.
    pub current_revision: String,
    /// Desired revision the workload is being moved to.
    pub updated_revision: String,
}

/// Controls one kind of workload.
///
/// Calls are synchronous and may block (an implementation can be a remote
/// process). A returned error is a domain failure for the rollout, not a
/// reason to retry the reconcile pass.
pub trait ResourcePlugin: Send + Sync {
    /// One-time initialization, called by the registry before first use.
    fn init(&self) -> PluginResult<()>;

    /// Read the workload's replica counters and revisions.
    fn get_status(&self, workload: &WorkloadRef) -> PluginResult<WorkloadStatus>;

    /// Send `weight` percent of traffic to the updated revision.
    fn set_weight(&self, workload: &WorkloadRef, weight: u32) -> PluginResult<()>;

    /// Whether a previously set weight has taken effect.
    fn verify_weight(&self, workload: &WorkloadRef, weight: u32) -> PluginResult<bool>;

    /// Move all traffic to the updated revision and make it stable.
    fn promote(&self, workload: &WorkloadRef) -> PluginResult<()>;

    /// Revert the workload to its stable revision.
    fn abort(&self, workload: &WorkloadRef) -> PluginResult<()>;

    /// Re-apply the updated revision after an abort.
    fn restart(&self, workload: &WorkloadRef) -> PluginResult<()>;
}
