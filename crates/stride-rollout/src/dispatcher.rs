//! Reconcile dispatch: turns store events into rollout keys and runs a
//! fixed pool of workers over the work queue.
//!
//! Reconcile passes call plugins synchronously, so each pass runs on the
//! blocking thread pool. A key is never reconciled by two workers at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use stride_state::{StoreEvent, object_key};

use crate::analysis::sweep_orphaned_runs;
use crate::error::ReconcileResult;
use crate::queue::WorkQueue;
use crate::reconcile::{Action, Reconciler};

pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    /// Consecutive failed passes per key.
    failures: Mutex<HashMap<String, u32>>,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<Reconciler>) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            queue: WorkQueue::new(),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let config = self.reconciler.config().clone();
        let mut events = self.reconciler.store().subscribe();

        let workers: Vec<_> = (0..config.workers.max(1))
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id)))
            .collect();
        info!(workers = workers.len(), "rollout dispatcher started");

        let mut resync = tokio::time::interval(config.resync_interval());
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = resync.tick() => {
                    self.resync();
                    self.sweep().await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.enqueue_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "store events dropped, resyncing");
                        self.resync();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.queue.shut_down();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "reconcile worker panicked");
            }
        }
        info!("rollout dispatcher stopped");
    }

    fn enqueue_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Rollout { namespace, name } => {
                self.queue.add(&object_key(&namespace, &name))
            }
            StoreEvent::AnalysisRun {
                namespace,
                owner: Some(owner),
                ..
            } => self.queue.add(&object_key(&namespace, &owner)),
            StoreEvent::AnalysisRun { owner: None, .. } => {}
        }
    }

    /// Queue every stored rollout.
    pub fn resync(&self) {
        match self.reconciler.store().list_rollouts() {
            Ok(rollouts) => {
                debug!(count = rollouts.len(), "resync");
                for rollout in rollouts {
                    self.queue.add(&rollout.key());
                }
            }
            Err(e) => warn!(error = %e, "resync failed to list rollouts"),
        }
    }

    async fn sweep(&self) {
        let store = self.reconciler.store().clone();
        match tokio::task::spawn_blocking(move || sweep_orphaned_runs(&store)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(deleted)) => info!(deleted, "orphaned analysis runs removed"),
            Ok(Err(e)) => warn!(error = %e, "orphan sweep failed"),
            Err(e) => error!(error = %e, "orphan sweep panicked"),
        }
    }

    async fn worker(self: Arc<Self>, id: usize) {
        while let Some(key) = self.queue.get().await {
            let Some((namespace, name)) = key.split_once('/') else {
                warn!(%key, "malformed rollout key dropped");
                self.queue.done(&key);
                continue;
            };
            let reconciler = Arc::clone(&self.reconciler);
            let (namespace, name) = (namespace.to_string(), name.to_string());
            let result =
                tokio::task::spawn_blocking(move || reconciler.reconcile(&namespace, &name)).await;
            self.handle_result(&key, result);
            self.queue.done(&key);
        }
        debug!(worker = id, "reconcile worker exiting");
    }

    fn handle_result(&self, key: &str, result: Result<ReconcileResult<Action>, JoinError>) {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        match result {
            Ok(Ok(action)) => {
                failures.remove(key);
                match action {
                    Action::AwaitChange => {}
                    Action::RequeueNow => self.queue.add(key),
                    Action::RequeueAfter(delay) => self.queue.add_after(key, delay),
                }
            }
            Ok(Err(e)) => {
                let count = failures.entry(key.to_string()).or_default();
                *count += 1;
                let delay = self.reconciler.config().retry_delay(*count);
                if e.is_conflict() {
                    debug!(%key, ?delay, "status write conflicted, retrying");
                } else {
                    warn!(%key, error = %e, attempt = *count, ?delay, "reconcile failed, retrying");
                }
                self.queue.add_after(key, delay);
            }
            Err(e) => {
                let count = failures.entry(key.to_string()).or_default();
                *count += 1;
                let delay = self.reconciler.config().retry_delay(*count);
                error!(%key, error = %e, ?delay, "reconcile pass panicked, retrying");
                self.queue.add_after(key, delay);
            }
        }
    }
}
