//! stride-plugin — workload control for the rollout controller.
//!
//! The controller never looks at a workload's concrete kind. Everything it
//! needs (status, traffic weight, promote, abort, restart) goes through the
//! [`ResourcePlugin`] capability, selected by name from a [`PluginRegistry`].
//!
//! # Components
//!
//! - **`plugin`**: the `ResourcePlugin` trait and `WorkloadStatus`
//! - **`registry`**: process-wide name → plugin map
//! - **`remote`**: adapter for plugins running out of process
//! - **`memory`**: in-memory workloads for standalone mode and tests

pub mod error;
pub mod memory;
pub mod plugin;
pub mod registry;
pub mod remote;

pub use error::{PluginError, PluginResult};
pub use memory::InMemoryWorkloads;
pub use plugin::{ResourcePlugin, WorkloadStatus};
pub use registry::PluginRegistry;
pub use remote::RemotePlugin;
