//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.
//! Status is owned by the controller; the only status writes made here are
//! the one-shot control flags.

use std::collections::BTreeMap;
use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, warn};

use stride_rollout::ControlAction;
use stride_rollout::control;
use stride_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error(e: &StateError) -> axum::response::Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_) | StateError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Rollouts ───────────────────────────────────────────────────

/// Body of a rollout apply. Identity comes from the path; the store owns
/// the rest of the metadata.
#[derive(serde::Deserialize)]
pub struct ApplyRolloutRequest {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: RolloutPluginSpec,
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_rollouts() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/rollouts/{namespace}/{name}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_rollout(&namespace, &name) {
        Ok(Some(rollout)) => ApiResponse::ok(rollout).into_response(),
        Ok(None) => error_response("rollout not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e),
    }
}

/// PUT /api/v1/rollouts/{namespace}/{name}
pub async fn apply_rollout(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<ApplyRolloutRequest>,
) -> impl IntoResponse {
    let existed = match state.store.get_rollout(&namespace, &name) {
        Ok(existing) => existing.is_some(),
        Err(e) => return state_error(&e),
    };

    let mut metadata = ObjectMeta::new(&namespace, &name);
    metadata.labels = req.labels;
    let rollout = RolloutPlugin {
        metadata,
        spec: req.spec,
        status: None,
    };

    match state.store.apply_rollout(&rollout) {
        Ok(stored) => {
            info!(
                rollout = %stored.key(),
                generation = stored.metadata.generation,
                "rollout applied"
            );
            let status = if existed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, ApiResponse::ok(stored)).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/rollouts/{namespace}/{name}
pub async fn delete_rollout(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.delete_rollout(&namespace, &name) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("rollout not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/rollouts/{namespace}/{name}/{action}
pub async fn control_rollout(
    State(state): State<ApiState>,
    Path((namespace, name, action)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let action = match ControlAction::from_str(&action) {
        Ok(action) => action,
        Err(msg) => return error_response(&msg, StatusCode::BAD_REQUEST).into_response(),
    };

    match control::request(&state.store, &namespace, &name, action) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => {
            warn!(
                rollout = %object_key(&namespace, &name),
                %action,
                error = %e,
                "control request failed"
            );
            state_error(&e)
        }
    }
}

/// GET /api/v1/rollouts/{namespace}/{name}/analysisruns
pub async fn list_analysis_runs(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let rollout = match state.store.get_rollout(&namespace, &name) {
        Ok(Some(rollout)) => rollout,
        Ok(None) => {
            return error_response("rollout not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => return state_error(&e),
    };

    match state.store.list_analysis_runs(&namespace) {
        Ok(runs) => {
            let owned: Vec<AnalysisRun> = runs
                .into_iter()
                .filter(|run| run.metadata.is_controlled_by(&rollout.metadata.uid))
                .collect();
            ApiResponse::ok(owned).into_response()
        }
        Err(e) => state_error(&e),
    }
}

// ── Templates ──────────────────────────────────────────────────

/// Body of a template put.
#[derive(serde::Deserialize)]
pub struct PutTemplateRequest {
    pub spec: AnalysisTemplateSpec,
}

/// PUT /api/v1/analysistemplates/{namespace}/{name}
pub async fn put_analysis_template(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<PutTemplateRequest>,
) -> impl IntoResponse {
    let template = AnalysisTemplate {
        metadata: ObjectMeta::new(&namespace, &name),
        spec: req.spec,
    };
    match state.store.put_analysis_template(&template) {
        Ok(stored) => ApiResponse::ok(stored).into_response(),
        Err(e) => state_error(&e),
    }
}

/// PUT /api/v1/clusteranalysistemplates/{name}
pub async fn put_cluster_analysis_template(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<PutTemplateRequest>,
) -> impl IntoResponse {
    let template = ClusterAnalysisTemplate {
        metadata: ObjectMeta::new("", &name),
        spec: req.spec,
    };
    match state.store.put_cluster_analysis_template(&template) {
        Ok(stored) => ApiResponse::ok(stored).into_response(),
        Err(e) => state_error(&e),
    }
}
