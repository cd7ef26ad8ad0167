//! REST API handlers.
//!
//! Each handler reads or writes through `MetaStore` and returns JSON.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use flowgate_core::ServiceRole;
use flowgate_store::{StoreError, WorkflowDefinition, epoch_secs};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    let status = match e {
        StoreError::SchemaNotMigrated(_) => StatusCode::SERVICE_UNAVAILABLE,
        ref e if e.is_connectivity() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn not_found(id: &str) -> Response {
    error_response(&format!("workflow not found: {id}"), StatusCode::NOT_FOUND)
}

/// Example workflows are invisible while examples are disabled.
fn visible(state: &ApiState, def: &WorkflowDefinition) -> bool {
    state.load_examples || !def.is_example
}

/// Look up a workflow the caller is allowed to see.
async fn find_workflow(state: &ApiState, id: &str) -> Result<WorkflowDefinition, Response> {
    match state.store.get_workflow(id).await {
        Ok(Some(def)) if visible(state, &def) => Ok(def),
        Ok(_) => Err(not_found(id)),
        Err(e) => Err(store_error(e)),
    }
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SchedulerHealth {
    pub status: String,
    pub latest_heartbeat: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub metadatabase: ComponentHealth,
    pub scheduler: SchedulerHealth,
}

fn status_str(healthy: bool) -> String {
    if healthy { "healthy" } else { "unhealthy" }.to_string()
}

/// GET /health
///
/// Always 200 while the process serves requests; the body says whether the
/// store answers and whether the scheduler heartbeat is fresh.
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let db_ok = state.store.ping().await.is_ok();

    let latest_heartbeat = if db_ok {
        state
            .store
            .latest_heartbeat(ServiceRole::SchedulerLoop.as_str())
            .await
            .unwrap_or_else(|e| {
                debug!(error = %e, "scheduler heartbeat unavailable");
                None
            })
    } else {
        None
    };
    let timeout = state.heartbeat_timeout.as_secs() as i64;
    let scheduler_ok = latest_heartbeat.is_some_and(|at| epoch_secs() - at <= timeout);

    Json(HealthReport {
        metadatabase: ComponentHealth {
            status: status_str(db_ok),
        },
        scheduler: SchedulerHealth {
            status: status_str(scheduler_ok),
            latest_heartbeat,
        },
    })
}

// ── Version ────────────────────────────────────────────────────

/// GET /api/v1/version
pub async fn version(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "executor": state.executor.as_str(),
        "store": state.store.backend(),
    }))
}

// ── Workflows ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub paused: Option<bool>,
    pub tag: Option<String>,
}

/// GET /api/v1/workflows
pub async fn list_workflows(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state.store.list_workflows().await {
        Ok(defs) => {
            let defs: Vec<WorkflowDefinition> = defs
                .into_iter()
                .filter(|d| visible(&state, d))
                .filter(|d| query.paused.is_none_or(|p| d.is_paused == p))
                .filter(|d| query.tag.as_ref().is_none_or(|t| d.tags.contains(t)))
                .collect();
            ApiResponse::ok(defs).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match find_workflow(&state, &id).await {
        Ok(def) => ApiResponse::ok(def).into_response(),
        Err(resp) => resp,
    }
}

/// Pause request body.
#[derive(Debug, Deserialize)]
pub struct PatchWorkflow {
    pub is_paused: bool,
}

/// PATCH /api/v1/workflows/{id}
pub async fn patch_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<PatchWorkflow>,
) -> Response {
    if let Err(resp) = find_workflow(&state, &id).await {
        return resp;
    }
    match state.store.set_workflow_paused(&id, req.is_paused).await {
        Ok(true) => {
            info!(workflow = %id, paused = req.is_paused, "workflow pause state changed");
            match find_workflow(&state, &id).await {
                Ok(def) => ApiResponse::ok(def).into_response(),
                Err(resp) => resp,
            }
        }
        Ok(false) => not_found(&id),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/workflows/{id}/runs
pub async fn list_runs(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if let Err(resp) = find_workflow(&state, &id).await {
        return resp;
    }
    match state.store.list_runs(&id).await {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => store_error(e),
    }
}
