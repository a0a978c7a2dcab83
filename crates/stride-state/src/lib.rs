//! stride-state — embedded object store for Stride.
//!
//! Backed by [redb](https://docs.rs/redb), holds the objects the rollout
//! controller reads and writes: `RolloutPlugin` objects, the `AnalysisRun`s
//! they spawn, and the namespace- and cluster-scoped analysis templates.
//!
//! # Architecture
//!
//! All objects are JSON-serialized into redb's `&[u8]` value columns.
//! Namespaced objects are keyed `{namespace}/{name}`, cluster-scoped ones by
//! `{name}`. Every write bumps the object's `resource_version`; status writes
//! are optimistic and fail with [`StateError::Conflict`] when the caller's
//! version is stale.
//!
//! Writes publish a [`StoreEvent`] on a broadcast channel so a dispatcher
//! can turn them into reconcile keys.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across worker threads.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, StoreEvent};
pub use types::*;
