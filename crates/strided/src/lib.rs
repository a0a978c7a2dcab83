//! strided — the Stride daemon.
//!
//! Assembles the object store, the registered resource plugins, the rollout
//! controller and the REST API into one process.

pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
