//! stride-api — REST API for the Stride rollout controller.
//!
//! Built on axum, provides endpoints for applying rollout objects and
//! analysis templates, inspecting rollout status and spawned analysis runs,
//! and issuing one-shot control actions.
//!
//! # Routes
//!
//! ```text
//! GET    /api/v1/rollouts                                  List rollouts
//! GET    /api/v1/rollouts/{namespace}/{name}               Get rollout
//! PUT    /api/v1/rollouts/{namespace}/{name}               Create or update rollout spec
//! DELETE /api/v1/rollouts/{namespace}/{name}               Delete rollout
//! POST   /api/v1/rollouts/{namespace}/{name}/{action}      abort | restart | allow-restart | promote
//! GET    /api/v1/rollouts/{namespace}/{name}/analysisruns  Runs owned by the rollout
//! PUT    /api/v1/analysistemplates/{namespace}/{name}      Put namespaced template
//! PUT    /api/v1/clusteranalysistemplates/{name}           Put cluster template
//! ```

pub mod handlers;

use axum::Router;
use axum::routing::{get, post, put};

use stride_state::StateStore;

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

/// Build the API router.
pub fn build_router(store: StateStore) -> Router {
    let api_state = ApiState { store };

    let api_routes = Router::new()
        .route("/rollouts", get(handlers::list_rollouts))
        .route(
            "/rollouts/{namespace}/{name}",
            get(handlers::get_rollout)
                .put(handlers::apply_rollout)
                .delete(handlers::delete_rollout),
        )
        .route(
            "/rollouts/{namespace}/{name}/analysisruns",
            get(handlers::list_analysis_runs),
        )
        .route(
            "/rollouts/{namespace}/{name}/{action}",
            post(handlers::control_rollout),
        )
        .route(
            "/analysistemplates/{namespace}/{name}",
            put(handlers::put_analysis_template),
        )
        .route(
            "/clusteranalysistemplates/{name}",
            put(handlers::put_cluster_analysis_template),
        )
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
