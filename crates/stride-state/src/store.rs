//! redb-backed persistence for Stride objects.
//!
//! Provides typed operations over rollout objects, analysis runs and analysis
//! templates. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).
//!
//! Writes that change an object publish a [`StoreEvent`]; writes that would
//! leave an object byte-for-byte unchanged are skipped entirely so an
//! idempotent reconcile pass never re-triggers itself.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type ObjectTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Capacity of the change-event channel. Slow subscribers observe
/// `RecvError::Lagged` and are expected to resync.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A change notification published after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A rollout object was created, updated or deleted.
    Rollout { namespace: String, name: String },
    /// An analysis run changed; `owner` names its controlling rollout, if any.
    AnalysisRun {
        namespace: String,
        name: String,
        owner: Option<String>,
    },
}

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "object store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory object store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(ANALYSIS_RUNS).map_err(map_err!(Table))?;
        txn.open_table(ANALYSIS_TEMPLATES).map_err(map_err!(Table))?;
        txn.open_table(CLUSTER_ANALYSIS_TEMPLATES)
            .map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to change events published after each committed write.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine (tests, CLI use).
        let _ = self.events.send(event);
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Create a rollout object, or update the spec and labels of an existing one.
    ///
    /// The store owns `uid`, `generation`, `resource_version` and
    /// `creation_timestamp`; an existing object's status is preserved.
    /// `generation` is bumped only when the spec actually changes.
    pub fn apply_rollout(&self, rollout: &RolloutPlugin) -> StateResult<RolloutPlugin> {
        let key = rollout.key();
        let (stored, changed) = self.with_table(ROLLOUTS, |table| {
            let existing: Option<RolloutPlugin> = read_entry(table, &key)?;
            let next = match existing {
                Some(current) => {
                    if current.spec == rollout.spec
                        && current.metadata.labels == rollout.metadata.labels
                    {
                        return Ok((current, false));
                    }
                    let mut next = current.clone();
                    if next.spec != rollout.spec {
                        next.metadata.generation += 1;
                    }
                    next.spec = rollout.spec.clone();
                    next.metadata.labels = rollout.metadata.labels.clone();
                    next.metadata.resource_version += 1;
                    next
                }
                None => {
                    let mut next = rollout.clone();
                    next.metadata.uid = new_uid(&key);
                    next.metadata.generation = 1;
                    next.metadata.resource_version = 1;
                    next.metadata.creation_timestamp = Some(Utc::now());
                    next.status = None;
                    next
                }
            };
            write_entry(table, &key, &next)?;
            Ok((next, true))
        })?;
        if changed {
            debug!(%key, generation = stored.metadata.generation, "rollout stored");
            self.publish(StoreEvent::Rollout {
                namespace: stored.metadata.namespace.clone(),
                name: stored.metadata.name.clone(),
            });
        }
        Ok(stored)
    }

    /// Get a rollout object by namespace and name.
    pub fn get_rollout(&self, namespace: &str, name: &str) -> StateResult<Option<RolloutPlugin>> {
        self.read_one(ROLLOUTS, &object_key(namespace, name))
    }

    /// List all rollout objects.
    pub fn list_rollouts(&self) -> StateResult<Vec<RolloutPlugin>> {
        self.read_prefix(ROLLOUTS, "")
    }

    /// Replace a rollout's status, optimistically against `resource_version`.
    ///
    /// Fails with [`StateError::Conflict`] when the object has been written
    /// since the caller read it. Writing a status equal to the stored one is
    /// a no-op: the version is not bumped and no event is published.
    pub fn update_rollout_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: u64,
        status: &RolloutPluginStatus,
    ) -> StateResult<RolloutPlugin> {
        let key = object_key(namespace, name);
        let (stored, changed) = self.with_table(ROLLOUTS, |table| {
            let mut current: RolloutPlugin = read_entry(table, &key)?
                .ok_or_else(|| StateError::NotFound(key.clone()))?;
            if current.metadata.resource_version != resource_version {
                return Err(StateError::Conflict {
                    key: key.clone(),
                    expected: resource_version,
                    found: current.metadata.resource_version,
                });
            }
            if current.status.as_ref() == Some(status) {
                return Ok((current, false));
            }
            current.status = Some(status.clone());
            current.metadata.resource_version += 1;
            write_entry(table, &key, &current)?;
            Ok((current, true))
        })?;
        if changed {
            debug!(
                %key,
                resource_version = stored.metadata.resource_version,
                "rollout status written"
            );
            self.publish(StoreEvent::Rollout {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(stored)
    }

    /// Read-modify-write a rollout's status in a single transaction.
    ///
    /// Used by operator-facing control actions, which must not race the
    /// controller's optimistic writes into a lost update.
    pub fn patch_rollout_status<F>(
        &self,
        namespace: &str,
        name: &str,
        patch: F,
    ) -> StateResult<RolloutPlugin>
    where
        F: FnOnce(&mut RolloutPluginStatus),
    {
        let key = object_key(namespace, name);
        let (stored, changed) = self.with_table(ROLLOUTS, |table| {
            let mut current: RolloutPlugin = read_entry(table, &key)?
                .ok_or_else(|| StateError::NotFound(key.clone()))?;
            let before = current.status.clone();
            patch(current.status.get_or_insert_with(Default::default));
            if current.status == before {
                return Ok((current, false));
            }
            current.metadata.resource_version += 1;
            write_entry(table, &key, &current)?;
            Ok((current, true))
        })?;
        if changed {
            self.publish(StoreEvent::Rollout {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(stored)
    }

    /// Delete a rollout object. Returns true if it existed.
    pub fn delete_rollout(&self, namespace: &str, name: &str) -> StateResult<bool> {
        let key = object_key(namespace, name);
        let existed = self.remove(ROLLOUTS, &key)?;
        debug!(%key, existed, "rollout deleted");
        if existed {
            self.publish(StoreEvent::Rollout {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(existed)
    }

    // ── Analysis runs ──────────────────────────────────────────────

    /// Create an analysis run. Fails with [`StateError::AlreadyExists`] when
    /// the name is taken.
    pub fn create_analysis_run(&self, run: &AnalysisRun) -> StateResult<AnalysisRun> {
        let key = run.metadata.table_key();
        let created = self.with_table(ANALYSIS_RUNS, |table| {
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key.clone()));
            }
            let mut next = run.clone();
            next.metadata.uid = new_uid(&key);
            next.metadata.generation = 1;
            next.metadata.resource_version = 1;
            if next.metadata.creation_timestamp.is_none() {
                next.metadata.creation_timestamp = Some(Utc::now());
            }
            write_entry(table, &key, &next)?;
            Ok(next)
        })?;
        debug!(%key, "analysis run created");
        self.publish_run(&created);
        Ok(created)
    }

    /// Get an analysis run by namespace and name.
    pub fn get_analysis_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> StateResult<Option<AnalysisRun>> {
        self.read_one(ANALYSIS_RUNS, &object_key(namespace, name))
    }

    /// List all analysis runs in a namespace.
    pub fn list_analysis_runs(&self, namespace: &str) -> StateResult<Vec<AnalysisRun>> {
        self.read_prefix(ANALYSIS_RUNS, &format!("{namespace}/"))
    }

    /// List analysis runs in every namespace.
    pub fn list_all_analysis_runs(&self) -> StateResult<Vec<AnalysisRun>> {
        self.read_prefix(ANALYSIS_RUNS, "")
    }

    /// Set the run's terminate flag. A run already terminating is left untouched.
    pub fn terminate_analysis_run(&self, namespace: &str, name: &str) -> StateResult<AnalysisRun> {
        self.modify_run(namespace, name, |run| {
            if run.spec.terminate {
                return false;
            }
            run.spec.terminate = true;
            true
        })
    }

    /// Replace a run's status. Written by the analysis executor.
    pub fn update_analysis_run_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AnalysisRunStatus,
    ) -> StateResult<AnalysisRun> {
        self.modify_run(namespace, name, |run| {
            if run.status.as_ref() == Some(status) {
                return false;
            }
            run.status = Some(status.clone());
            true
        })
    }

    /// Delete an analysis run. Returns true if it existed.
    pub fn delete_analysis_run(&self, namespace: &str, name: &str) -> StateResult<bool> {
        let key = object_key(namespace, name);
        let removed: Option<AnalysisRun> = self.with_table(ANALYSIS_RUNS, |table| {
            let existing = read_entry(table, &key)?;
            if existing.is_some() {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            Ok(existing)
        })?;
        debug!(%key, existed = removed.is_some(), "analysis run deleted");
        match removed {
            Some(run) => {
                self.publish_run(&run);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn modify_run<F>(&self, namespace: &str, name: &str, modify: F) -> StateResult<AnalysisRun>
    where
        F: FnOnce(&mut AnalysisRun) -> bool,
    {
        let key = object_key(namespace, name);
        let (run, changed) = self.with_table(ANALYSIS_RUNS, |table| {
            let mut run: AnalysisRun = read_entry(table, &key)?
                .ok_or_else(|| StateError::NotFound(key.clone()))?;
            if !modify(&mut run) {
                return Ok((run, false));
            }
            run.metadata.resource_version += 1;
            write_entry(table, &key, &run)?;
            Ok((run, true))
        })?;
        if changed {
            self.publish_run(&run);
        }
        Ok(run)
    }

    fn publish_run(&self, run: &AnalysisRun) {
        self.publish(StoreEvent::AnalysisRun {
            namespace: run.metadata.namespace.clone(),
            name: run.metadata.name.clone(),
            owner: run.metadata.controller().map(|owner| owner.name.clone()),
        });
    }

    // ── Templates ──────────────────────────────────────────────────

    /// Insert or update a namespace-scoped analysis template.
    pub fn put_analysis_template(
        &self,
        template: &AnalysisTemplate,
    ) -> StateResult<AnalysisTemplate> {
        let key = template.metadata.table_key();
        let stored = self.with_table(ANALYSIS_TEMPLATES, |table| {
            let existing: Option<AnalysisTemplate> = read_entry(table, &key)?;
            let next = stamp_template(&key, template.clone(), existing.map(|t| t.metadata), |t| {
                &mut t.metadata
            });
            write_entry(table, &key, &next)?;
            Ok(next)
        })?;
        debug!(%key, "analysis template stored");
        Ok(stored)
    }

    /// Get a namespace-scoped analysis template.
    pub fn get_analysis_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> StateResult<Option<AnalysisTemplate>> {
        self.read_one(ANALYSIS_TEMPLATES, &object_key(namespace, name))
    }

    /// Insert or update a cluster-scoped analysis template.
    pub fn put_cluster_analysis_template(
        &self,
        template: &ClusterAnalysisTemplate,
    ) -> StateResult<ClusterAnalysisTemplate> {
        let key = template.metadata.name.clone();
        let stored = self.with_table(CLUSTER_ANALYSIS_TEMPLATES, |table| {
            let existing: Option<ClusterAnalysisTemplate> = read_entry(table, &key)?;
            let mut template = template.clone();
            template.metadata.namespace.clear();
            let next = stamp_template(&key, template, existing.map(|t| t.metadata), |t| {
                &mut t.metadata
            });
            write_entry(table, &key, &next)?;
            Ok(next)
        })?;
        debug!(%key, "cluster analysis template stored");
        Ok(stored)
    }

    /// Get a cluster-scoped analysis template.
    pub fn get_cluster_analysis_template(
        &self,
        name: &str,
    ) -> StateResult<Option<ClusterAnalysisTemplate>> {
        self.read_one(CLUSTER_ANALYSIS_TEMPLATES, name)
    }

    // ── Table helpers ──────────────────────────────────────────────

    /// Run `f` against a table inside one write transaction. The transaction
    /// commits only when `f` succeeds.
    fn with_table<R, F>(&self, definition: ObjectTable, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut redb::Table<'_, &'static str, &'static [u8]>) -> StateResult<R>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
            f(&mut table)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    fn read_one<T: DeserializeOwned>(
        &self,
        definition: ObjectTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(definition).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn read_prefix<T: DeserializeOwned>(
        &self,
        definition: ObjectTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(definition).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let object = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(object);
            }
        }
        Ok(results)
    }

    fn remove(&self, definition: ObjectTable, key: &str) -> StateResult<bool> {
        self.with_table(definition, |table| {
            Ok(table.remove(key).map_err(map_err!(Write))?.is_some())
        })
    }
}

fn read_entry<T: DeserializeOwned>(
    table: &redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn write_entry<T: Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Carry store-owned metadata over from the previous version of a template.
fn stamp_template<T>(
    key: &str,
    mut template: T,
    previous: Option<ObjectMeta>,
    meta: impl Fn(&mut T) -> &mut ObjectMeta,
) -> T {
    let m = meta(&mut template);
    match previous {
        Some(prev) => {
            m.uid = prev.uid;
            m.creation_timestamp = prev.creation_timestamp;
            m.generation = prev.generation + 1;
            m.resource_version = prev.resource_version + 1;
        }
        None => {
            m.uid = new_uid(key);
            m.creation_timestamp = Some(Utc::now());
            m.generation = 1;
            m.resource_version = 1;
        }
    }
    template
}

/// Generate a unique object identifier in the 8-4-4-4-12 hex layout.
fn new_uid(key: &str) -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let digest = Sha256::digest(format!("{key}:{nanos}:{seq}").as_bytes());
    let hex = hex::encode(&digest[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_rollout(namespace: &str, name: &str) -> RolloutPlugin {
        RolloutPlugin {
            metadata: ObjectMeta::new(namespace, name),
            spec: RolloutPluginSpec {
                workload_ref: WorkloadRef {
                    kind: "StatefulSet".to_string(),
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                },
                plugin: "statefulset".to_string(),
                strategy: CanaryStrategy {
                    steps: vec![CanaryStep::set_weight(20), CanaryStep::pause(Some("1m"))],
                    analysis: None,
                },
                paused: false,
                min_ready_seconds: 0,
                progress_deadline_seconds: None,
                progress_deadline_abort: false,
            },
            status: None,
        }
    }

    fn test_run(namespace: &str, name: &str, owner_uid: &str) -> AnalysisRun {
        let mut metadata = ObjectMeta::new(namespace, name);
        metadata.owner_references.push(OwnerReference {
            kind: ROLLOUT_PLUGIN_KIND.to_string(),
            name: "api".to_string(),
            uid: owner_uid.to_string(),
            controller: true,
        });
        AnalysisRun {
            metadata,
            spec: AnalysisRunSpec {
                metrics: vec![Metric {
                    name: "error-rate".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        }
    }

    // ── Rollout CRUD ───────────────────────────────────────────────

    #[test]
    fn rollout_apply_assigns_identity() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.apply_rollout(&test_rollout("prod", "api")).unwrap();

        assert_eq!(stored.metadata.generation, 1);
        assert_eq!(stored.metadata.resource_version, 1);
        assert_eq!(stored.metadata.uid.len(), 36);
        assert!(stored.metadata.creation_timestamp.is_some());

        let retrieved = store.get_rollout("prod", "api").unwrap();
        assert_eq!(retrieved, Some(stored));
    }

    #[test]
    fn rollout_reapply_bumps_generation_only_on_spec_change() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rollout = test_rollout("prod", "api");
        let first = store.apply_rollout(&rollout).unwrap();

        let same = store.apply_rollout(&rollout).unwrap();
        assert_eq!(same.metadata.resource_version, first.metadata.resource_version);

        rollout.spec.paused = true;
        let updated = store.apply_rollout(&rollout).unwrap();
        assert_eq!(updated.metadata.generation, 2);
        assert_eq!(updated.metadata.uid, first.metadata.uid);

        rollout.metadata.labels.insert("team".to_string(), "web".to_string());
        let relabeled = store.apply_rollout(&rollout).unwrap();
        assert_eq!(relabeled.metadata.generation, 2);
        assert_eq!(relabeled.metadata.resource_version, 3);
    }

    #[test]
    fn rollout_apply_preserves_status() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rollout = test_rollout("prod", "api");
        let stored = store.apply_rollout(&rollout).unwrap();
        let status = RolloutPluginStatus {
            phase: Some(RolloutPhase::Healthy),
            ..Default::default()
        };
        store
            .update_rollout_status("prod", "api", stored.metadata.resource_version, &status)
            .unwrap();

        rollout.spec.min_ready_seconds = 5;
        let updated = store.apply_rollout(&rollout).unwrap();
        assert_eq!(updated.status, Some(status));
    }

    #[test]
    fn status_update_rejects_stale_version() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.apply_rollout(&test_rollout("prod", "api")).unwrap();
        let status = RolloutPluginStatus {
            message: "first".to_string(),
            ..Default::default()
        };
        store
            .update_rollout_status("prod", "api", stored.metadata.resource_version, &status)
            .unwrap();

        let stale = RolloutPluginStatus {
            message: "second".to_string(),
            ..Default::default()
        };
        let err = store
            .update_rollout_status("prod", "api", stored.metadata.resource_version, &stale)
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict { expected: 1, found: 2, .. }));
    }

    #[test]
    fn unchanged_status_write_is_a_noop() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.apply_rollout(&test_rollout("prod", "api")).unwrap();
        let status = RolloutPluginStatus::default();
        let first = store
            .update_rollout_status("prod", "api", stored.metadata.resource_version, &status)
            .unwrap();

        let mut events = store.subscribe();
        let second = store
            .update_rollout_status("prod", "api", first.metadata.resource_version, &status)
            .unwrap();
        assert_eq!(second.metadata.resource_version, first.metadata.resource_version);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn patch_status_publishes_event() {
        let store = StateStore::open_in_memory().unwrap();
        store.apply_rollout(&test_rollout("prod", "api")).unwrap();
        let mut events = store.subscribe();

        let patched = store
            .patch_rollout_status("prod", "api", |status| status.abort = true)
            .unwrap();
        assert!(patched.status.unwrap().abort);
        assert_eq!(
            events.try_recv().unwrap(),
            StoreEvent::Rollout {
                namespace: "prod".to_string(),
                name: "api".to_string()
            }
        );
    }

    #[test]
    fn status_update_missing_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .update_rollout_status("prod", "nope", 1, &RolloutPluginStatus::default())
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn rollout_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.apply_rollout(&test_rollout("prod", "api")).unwrap();

        assert!(store.delete_rollout("prod", "api").unwrap());
        assert!(!store.delete_rollout("prod", "api").unwrap());
        assert!(store.get_rollout("prod", "api").unwrap().is_none());
    }

    // ── Analysis runs ──────────────────────────────────────────────

    #[test]
    fn analysis_run_create_rejects_duplicates() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run("prod", "api-step-0", "uid-1");
        let created = store.create_analysis_run(&run).unwrap();
        assert!(!created.metadata.uid.is_empty());

        let err = store.create_analysis_run(&run).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn analysis_run_keeps_explicit_creation_timestamp() {
        let store = StateStore::open_in_memory().unwrap();
        let mut run = test_run("prod", "api-step-0", "uid-1");
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        run.metadata.creation_timestamp = Some(ts);
        let created = store.create_analysis_run(&run).unwrap();
        assert_eq!(created.metadata.creation_timestamp, Some(ts));
    }

    #[test]
    fn analysis_run_list_is_namespace_scoped() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_analysis_run(&test_run("prod", "a", "uid-1")).unwrap();
        store.create_analysis_run(&test_run("prod", "b", "uid-1")).unwrap();
        store.create_analysis_run(&test_run("staging", "c", "uid-2")).unwrap();

        assert_eq!(store.list_analysis_runs("prod").unwrap().len(), 2);
        assert_eq!(store.list_analysis_runs("staging").unwrap().len(), 1);
        assert!(store.list_analysis_runs("dev").unwrap().is_empty());
        assert_eq!(store.list_all_analysis_runs().unwrap().len(), 3);
    }

    #[test]
    fn terminate_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_analysis_run(&test_run("prod", "a", "uid-1")).unwrap();

        let first = store.terminate_analysis_run("prod", "a").unwrap();
        assert!(first.spec.terminate);
        let second = store.terminate_analysis_run("prod", "a").unwrap();
        assert_eq!(second.metadata.resource_version, first.metadata.resource_version);
    }

    #[test]
    fn analysis_run_event_names_owner() {
        let store = StateStore::open_in_memory().unwrap();
        let mut events = store.subscribe();
        store.create_analysis_run(&test_run("prod", "a", "uid-1")).unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            StoreEvent::AnalysisRun {
                namespace: "prod".to_string(),
                name: "a".to_string(),
                owner: Some("api".to_string()),
            }
        );
    }

    #[test]
    fn analysis_run_status_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_analysis_run(&test_run("prod", "a", "uid-1")).unwrap();
        let status = AnalysisRunStatus {
            phase: Some(AnalysisPhase::Successful),
            ..Default::default()
        };
        let updated = store.update_analysis_run_status("prod", "a", &status).unwrap();
        assert_eq!(updated.phase(), Some(&AnalysisPhase::Successful));

        assert!(store.delete_analysis_run("prod", "a").unwrap());
        assert!(!store.delete_analysis_run("prod", "a").unwrap());
    }

    // ── Templates ──────────────────────────────────────────────────

    #[test]
    fn templates_are_scoped_separately() {
        let store = StateStore::open_in_memory().unwrap();
        let spec = AnalysisTemplateSpec {
            metrics: vec![Metric {
                name: "error-rate".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        store
            .put_analysis_template(&AnalysisTemplate {
                metadata: ObjectMeta::new("prod", "error-rate"),
                spec: spec.clone(),
            })
            .unwrap();
        store
            .put_cluster_analysis_template(&ClusterAnalysisTemplate {
                metadata: ObjectMeta::new("ignored", "latency"),
                spec,
            })
            .unwrap();

        assert!(store.get_analysis_template("prod", "error-rate").unwrap().is_some());
        assert!(store.get_analysis_template("prod", "latency").unwrap().is_none());
        let cluster = store.get_cluster_analysis_template("latency").unwrap().unwrap();
        assert!(cluster.metadata.namespace.is_empty());
        assert!(store.get_cluster_analysis_template("error-rate").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.apply_rollout(&test_rollout("prod", "api")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let rollout = store.get_rollout("prod", "api").unwrap();
        assert_eq!(rollout.unwrap().metadata.name, "api");
    }

    #[test]
    fn uids_are_unique() {
        let a = new_uid("prod/api");
        let b = new_uid("prod/api");
        assert_ne!(a, b);
        assert_eq!(a.matches('-').count(), 4);
    }
}
