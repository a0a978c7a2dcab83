//! redb table definitions for the Stride object store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Namespaced keys follow the pattern `{namespace}/{name}`.

use redb::TableDefinition;

/// `RolloutPlugin` objects keyed by `{namespace}/{name}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// `AnalysisRun` objects keyed by `{namespace}/{name}`.
pub const ANALYSIS_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("analysis_runs");

/// `AnalysisTemplate` objects keyed by `{namespace}/{name}`.
pub const ANALYSIS_TEMPLATES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("analysis_templates");

/// `ClusterAnalysisTemplate` objects keyed by `{name}`.
pub const CLUSTER_ANALYSIS_TEMPLATES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("cluster_analysis_templates");
