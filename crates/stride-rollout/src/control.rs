//! Operator control requests.
//!
//! Requests are one-shot flags on the rollout status. They are written with
//! an atomic read-modify-write so they cannot be lost to a concurrent
//! reconcile pass; the controller consumes them on its next pass.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use stride_state::{RolloutPlugin, StateResult, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlAction {
    /// Revert the workload and stop the rollout.
    Abort,
    /// Re-run an aborted rollout from the first step.
    Restart,
    /// Permit a previously aborted revision to roll out again.
    AllowRestart,
    /// Skip the remaining steps and promote.
    PromoteFull,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Restart => "restart",
            Self::AllowRestart => "allow-restart",
            Self::PromoteFull => "promote-full",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(Self::Abort),
            "restart" => Ok(Self::Restart),
            "allow-restart" => Ok(Self::AllowRestart),
            "promote" | "promote-full" => Ok(Self::PromoteFull),
            other => Err(format!("unknown control action: {other}")),
        }
    }
}

/// Set the request flag for `action` on the rollout `namespace/name`.
pub fn request(
    store: &StateStore,
    namespace: &str,
    name: &str,
    action: ControlAction,
) -> StateResult<RolloutPlugin> {
    let updated = store.patch_rollout_status(namespace, name, |status| match action {
        ControlAction::Abort => status.abort = true,
        ControlAction::Restart => status.restart = true,
        ControlAction::AllowRestart => status.allow_restart = true,
        ControlAction::PromoteFull => status.promote_full = true,
    })?;
    info!(rollout = %updated.key(), %action, "control action requested");
    Ok(updated)
}
