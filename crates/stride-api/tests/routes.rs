//! Routing tests: drive the full router the way a client would.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use stride_api::build_router;
use stride_state::*;

fn rollout_body() -> Value {
    json!({
        "spec": {
            "workload_ref": { "kind": "StatefulSet", "name": "api" },
            "plugin": "memory",
            "strategy": {
                "steps": [
                    { "set_weight": 20 },
                    { "pause": { "duration": "30s" } },
                    { "set_weight": 100 }
                ]
            }
        }
    })
}

fn put(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn empty(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn apply_get_and_list_rollout() {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store);

    let resp = router
        .clone()
        .oneshot(put("/api/v1/rollouts/prod/api", &rollout_body()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = json_body(resp).await;
    assert_eq!(created["data"]["metadata"]["generation"], 1);
    assert_eq!(created["data"]["spec"]["strategy"]["steps"][0]["set_weight"], 20);

    let resp = router
        .clone()
        .oneshot(empty("GET", "/api/v1/rollouts/prod/api"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(empty("GET", "/api/v1/rollouts"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let listed = json_body(resp).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn control_actions_set_flags() {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store.clone());

    router
        .clone()
        .oneshot(put("/api/v1/rollouts/prod/api", &rollout_body()))
        .await
        .unwrap();

    for action in ["abort", "restart", "allow-restart", "promote"] {
        let uri = format!("/api/v1/rollouts/prod/api/{action}");
        let resp = router.clone().oneshot(empty("POST", &uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "action {action}");
    }

    let status = store
        .get_rollout("prod", "api")
        .unwrap()
        .unwrap()
        .status
        .unwrap();
    assert!(status.abort);
    assert!(status.restart);
    assert!(status.allow_restart);
    assert!(status.promote_full);

    let resp = router
        .oneshot(empty("POST", "/api/v1/rollouts/prod/api/rollback"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_rollout_then_not_found() {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store);

    router
        .clone()
        .oneshot(put("/api/v1/rollouts/prod/web", &rollout_body()))
        .await
        .unwrap();

    let resp = router
        .clone()
        .oneshot(empty("DELETE", "/api/v1/rollouts/prod/web"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(empty("GET", "/api/v1/rollouts/prod/web"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn analysis_runs_route_is_not_a_control_action() {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store);

    router
        .clone()
        .oneshot(put("/api/v1/rollouts/prod/api", &rollout_body()))
        .await
        .unwrap();

    let resp = router
        .oneshot(empty("GET", "/api/v1/rollouts/prod/api/analysisruns"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let runs = json_body(resp).await;
    assert!(runs["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn templates_are_stored() {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store.clone());
    let template = json!({
        "spec": {
            "args": [{ "name": "service" }],
            "metrics": [{ "name": "error-rate", "success_condition": "result < 0.05" }]
        }
    });

    let resp = router
        .clone()
        .oneshot(put("/api/v1/analysistemplates/prod/error-rate", &template))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(put("/api/v1/clusteranalysistemplates/error-rate", &template))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let namespaced = store
        .get_analysis_template("prod", "error-rate")
        .unwrap()
        .unwrap();
    assert_eq!(namespaced.spec.metrics[0].name, "error-rate");
    assert!(
        store
            .get_cluster_analysis_template("error-rate")
            .unwrap()
            .is_some()
    );
}
