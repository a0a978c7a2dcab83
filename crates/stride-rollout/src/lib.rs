//! stride-rollout — progressive delivery controller for `RolloutPlugin`
//! objects.
//!
//! A [`Reconciler`] pass moves one rollout forward: it validates the spec,
//! resolves the workload's [`ResourcePlugin`](stride_plugin::ResourcePlugin),
//! handles operator requests (abort, restart, promote), tracks the workload's
//! revisions, manages the rollout's analysis runs and runs the current
//! canary step. The [`Dispatcher`] feeds passes from store events through a
//! deduplicating [`WorkQueue`].
//!
//! ```text
//!  StateStore events ──► Dispatcher ──► WorkQueue ──► workers
//!                                                        │
//!                                                  Reconciler::reconcile
//!                                                   ├─ AnalysisManager
//!                                                   └─ step engine
//! ```

pub mod analysis;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod duration;
pub mod error;
pub mod queue;
pub mod reconcile;
mod status;
pub mod steps;
pub mod validation;

pub use analysis::{AnalysisError, AnalysisManager, AnalysisOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ControllerConfig;
pub use control::ControlAction;
pub use dispatcher::Dispatcher;
pub use error::{ReconcileError, ReconcileResult};
pub use queue::WorkQueue;
pub use reconcile::{Action, Reconciler};
