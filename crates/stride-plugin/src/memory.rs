//! In-memory workloads.
//!
//! A `ResourcePlugin` that keeps workload state in a map instead of talking
//! to a real workload controller. The daemon's standalone mode registers it
//! so rollouts can be exercised end to end without a cluster, and tests use
//! it to observe what the controller asked for.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use stride_state::WorkloadRef;

use crate::error::{PluginError, PluginResult};
use crate::plugin::{ResourcePlugin, WorkloadStatus};

/// Recorded state of one workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadRecord {
    pub status: WorkloadStatus,
    /// Last weight applied with `set_weight`.
    pub weight: u32,
    pub promotions: u32,
    pub aborts: u32,
    pub restarts: u32,
}

/// Workloads keyed by `{namespace}/{name}`.
#[derive(Default)]
pub struct InMemoryWorkloads {
    workloads: Mutex<HashMap<String, WorkloadRecord>>,
}

fn workload_key(workload: &WorkloadRef) -> String {
    format!("{}/{}", workload.namespace, workload.name)
}

impl InMemoryWorkloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workload's status. Recorded counters are kept.
    pub fn upsert(&self, workload: &WorkloadRef, status: WorkloadStatus) -> PluginResult<()> {
        let mut workloads = self.workloads.lock().map_err(|_| PluginError::Poisoned)?;
        workloads.entry(workload_key(workload)).or_default().status = status;
        Ok(())
    }

    /// Point the workload at a new desired revision, as an author editing
    /// the workload template would.
    pub fn set_updated_revision(&self, workload: &WorkloadRef, revision: &str) -> PluginResult<()> {
        self.modify(workload, |record| {
            record.status.updated_revision = revision.to_string();
            record.status.updated_replicas = 0;
        })
    }

    /// Snapshot of a workload's record.
    pub fn record(&self, workload: &WorkloadRef) -> Option<WorkloadRecord> {
        let workloads = self.workloads.lock().ok()?;
        workloads.get(&workload_key(workload)).cloned()
    }

    fn modify<F>(&self, workload: &WorkloadRef, f: F) -> PluginResult<()>
    where
        F: FnOnce(&mut WorkloadRecord),
    {
        let mut workloads = self.workloads.lock().map_err(|_| PluginError::Poisoned)?;
        let record = workloads
            .get_mut(&workload_key(workload))
            .ok_or_else(|| PluginError::WorkloadNotFound(workload.to_string()))?;
        f(record);
        Ok(())
    }
}

impl ResourcePlugin for InMemoryWorkloads {
    fn init(&self) -> PluginResult<()> {
        Ok(())
    }

    fn get_status(&self, workload: &WorkloadRef) -> PluginResult<WorkloadStatus> {
        self.record(workload)
            .map(|record| record.status)
            .ok_or_else(|| PluginError::WorkloadNotFound(workload.to_string()))
    }

    fn set_weight(&self, workload: &WorkloadRef, weight: u32) -> PluginResult<()> {
        self.modify(workload, |record| {
            record.weight = weight;
            let replicas = u64::try_from(record.status.replicas).unwrap_or(0);
            let updated = (replicas * u64::from(weight)).div_ceil(100);
            record.status.updated_replicas = i32::try_from(updated).unwrap_or(i32::MAX);
        })?;
        debug!(%workload, weight, "weight set");
        Ok(())
    }

    fn verify_weight(&self, workload: &WorkloadRef, weight: u32) -> PluginResult<bool> {
        self.record(workload)
            .map(|record| record.weight == weight)
            .ok_or_else(|| PluginError::WorkloadNotFound(workload.to_string()))
    }

    fn promote(&self, workload: &WorkloadRef) -> PluginResult<()> {
        self.modify(workload, |record| {
            record.weight = 100;
            record.promotions += 1;
            record.status.current_revision = record.status.updated_revision.clone();
            record.status.updated_replicas = record.status.replicas;
        })
    }

    fn abort(&self, workload: &WorkloadRef) -> PluginResult<()> {
        self.modify(workload, |record| {
            record.weight = 0;
            record.aborts += 1;
            record.status.updated_replicas = 0;
        })
    }

    fn restart(&self, workload: &WorkloadRef) -> PluginResult<()> {
        self.modify(workload, |record| {
            record.weight = 0;
            record.restarts += 1;
        })
    }
}
