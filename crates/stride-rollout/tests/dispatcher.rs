//! The dispatcher drives a rollout to completion from store events alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use stride_plugin::{InMemoryWorkloads, PluginRegistry, ResourcePlugin, WorkloadStatus};
use stride_rollout::{ControllerConfig, Dispatcher, Reconciler, SystemClock};
use stride_state::*;

fn rollout() -> RolloutPlugin {
    RolloutPlugin {
        metadata: ObjectMeta::new("prod", "api"),
        spec: RolloutPluginSpec {
            workload_ref: WorkloadRef {
                kind: "StatefulSet".to_string(),
                name: "api".to_string(),
                namespace: String::new(),
            },
            plugin: "memory".to_string(),
            strategy: CanaryStrategy {
                steps: vec![CanaryStep::set_weight(25), CanaryStep::set_weight(75)],
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

async fn wait_for<F>(store: &StateStore, what: &str, check: F)
where
    F: Fn(&RolloutPluginStatus) -> bool,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = store
                .get_rollout("prod", "api")
                .unwrap()
                .and_then(|r| r.status);
            if status.as_ref().is_some_and(&check) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollout_progresses_to_healthy() {
    let store = StateStore::open_in_memory().unwrap();
    let workloads = Arc::new(InMemoryWorkloads::new());
    let workload = WorkloadRef {
        kind: "StatefulSet".to_string(),
        name: "api".to_string(),
        namespace: "prod".to_string(),
    };
    workloads
        .upsert(
            &workload,
            WorkloadStatus {
                replicas: 4,
                updated_replicas: 0,
                ready_replicas: 4,
                available_replicas: 4,
                current_revision: "rev-1".to_string(),
                updated_revision: "rev-2".to_string(),
            },
        )
        .unwrap();
    let registry = Arc::new(PluginRegistry::new());
    registry.register("memory", workloads.clone()).unwrap();

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        registry,
        Arc::new(SystemClock),
        ControllerConfig::default(),
    ));
    let dispatcher = Dispatcher::new(reconciler);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(shutdown_rx));

    store.apply_rollout(&rollout()).unwrap();

    wait_for(&store, "healthy phase", |status| {
        status.phase == Some(RolloutPhase::Healthy)
            && status.current_revision.as_deref() == Some("rev-2")
    })
    .await;

    let record = workloads.record(&workload).unwrap();
    assert_eq!(record.promotions, 1);
    assert_eq!(record.weight, 100);
    assert_eq!(workloads.get_status(&workload).unwrap().current_revision, "rev-2");

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_request_is_picked_up_from_events() {
    let store = StateStore::open_in_memory().unwrap();
    let workloads = Arc::new(InMemoryWorkloads::new());
    let workload = WorkloadRef {
        kind: "StatefulSet".to_string(),
        name: "api".to_string(),
        namespace: "prod".to_string(),
    };
    workloads
        .upsert(
            &workload,
            WorkloadStatus {
                replicas: 4,
                updated_replicas: 0,
                ready_replicas: 4,
                available_replicas: 4,
                current_revision: "rev-1".to_string(),
                updated_revision: "rev-2".to_string(),
            },
        )
        .unwrap();
    let registry = Arc::new(PluginRegistry::new());
    registry.register("memory", workloads.clone()).unwrap();
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        registry,
        Arc::new(SystemClock),
        ControllerConfig::default(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Dispatcher::new(reconciler).run(shutdown_rx));

    let mut paused = rollout();
    paused.spec.strategy.steps = vec![CanaryStep::set_weight(25), CanaryStep::pause(None)];
    store.apply_rollout(&paused).unwrap();
    wait_for(&store, "indefinite pause", |status| {
        status.paused && status.current_step_index == Some(1)
    })
    .await;

    stride_rollout::control::request(&store, "prod", "api", stride_rollout::ControlAction::Abort)
        .unwrap();
    wait_for(&store, "abort", |status| {
        status.aborted && status.phase == Some(RolloutPhase::Degraded)
    })
    .await;
    assert_eq!(workloads.record(&workload).unwrap().aborts, 1);

    let _ = shutdown_tx.send(true);
    handle.await.unwrap();
}
