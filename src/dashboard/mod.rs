//! JSON status API over the scheduler and the open worker sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::LooperError;
use crate::graph::Commit;
use crate::model::{BranchId, CommitId, TestRunRecord};
use crate::protocol::SessionRegistry;
use crate::scheduler::{SharedManager, TestManager};

#[derive(Clone)]
pub struct DashboardState {
    pub manager: SharedManager,
    pub registry: Arc<SessionRegistry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    branches: usize,
    commits: usize,
    commits_pending_definitions: usize,
    running_tests: usize,
    idle_machines: usize,
    machines_seen: usize,
    sessions: usize,
    pending_periodic_tests: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    commit_id: CommitId,
    subject: String,
    needs_build: bool,
    broken_build: bool,
    running_tests: usize,
    completed_runs: usize,
    full_passes_completed: usize,
    pass_rate: Option<f64>,
    definitions_error: Option<String>,
}

impl From<&Commit> for CommitResponse {
    fn from(commit: &Commit) -> Self {
        Self {
            commit_id: commit.commit_id().clone(),
            subject: commit.subject().to_string(),
            needs_build: commit.needs_build(),
            broken_build: commit.is_broken_build(),
            running_tests: commit.total_running_count(),
            completed_runs: commit.total_completed_test_runs(),
            full_passes_completed: commit.full_passes_completed(),
            pass_rate: commit.pass_rate(),
            definitions_error: commit.definitions_error().map(str::to_string),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BranchResponse {
    branch: BranchId,
    deep_test: bool,
    targeted_tests: Vec<String>,
    targeted_commit_ids: Vec<CommitId>,
    commits: Vec<CommitResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearRequest {
    commit_id: CommitId,
    #[serde(default)]
    test_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetingRequest {
    branch: BranchId,
    #[serde(default)]
    tests: Option<Vec<String>>,
    #[serde(default)]
    commit_ids: Option<Vec<CommitId>>,
    #[serde(default)]
    deep_test: Option<bool>,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    error: Option<String>,
}

fn action_result(result: Result<(), LooperError>) -> (StatusCode, Json<ActionResponse>) {
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(ActionResponse {
                success: true,
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                LooperError::CommitNotFound(_)
                | LooperError::TestNotFound(_)
                | LooperError::BranchNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(ActionResponse {
                    success: false,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/branches", get(list_branches_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/tests/{test_id}", get(test_handler))
        .route("/api/clear", post(clear_handler))
        .route("/api/targeting", post(targeting_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Status API server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let manager = state.manager.lock().await;
    Json(StatusResponse {
        branches: manager.branches().count(),
        commits: manager.commits().count(),
        commits_pending_definitions: manager.commits_needing_definitions().len(),
        running_tests: manager.commits().map(Commit::total_running_count).sum(),
        idle_machines: manager.blocking_machines().idle_machines().len(),
        machines_seen: manager.machines_seen(),
        sessions: state.registry.len(),
        pending_periodic_tests: manager.has_pending_periodic_tests(),
    })
}

async fn list_branches_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let manager = state.manager.lock().await;
    let branches: Vec<BranchResponse> = manager
        .branches()
        .map(|branch| BranchResponse {
            branch: branch.branch_id().clone(),
            deep_test: branch.is_deep_test(),
            targeted_tests: branch.targeted_tests().to_vec(),
            targeted_commit_ids: branch.targeted_commit_ids().into_iter().cloned().collect(),
            commits: manager
                .commits_in_branch(branch.branch_id())
                .into_iter()
                .map(CommitResponse::from)
                .collect(),
        })
        .collect();

    Json(branches)
}

async fn list_sessions_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn test_handler(
    State(state): State<DashboardState>,
    Path(test_id): Path<String>,
) -> Result<Json<TestRunRecord>, StatusCode> {
    let manager = state.manager.lock().await;
    manager
        .test_by_id(&test_id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn clear_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<ClearRequest>,
) -> impl IntoResponse {
    let mut manager = state.manager.lock().await;
    let result = match &payload.test_id {
        Some(test_id) => manager.clear_test_result(&payload.commit_id, test_id),
        None => manager.clear_commit(&payload.commit_id),
    };
    action_result(result)
}

async fn targeting_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<TargetingRequest>,
) -> impl IntoResponse {
    let mut manager = state.manager.lock().await;
    action_result(apply_targeting(&mut manager, payload))
}

fn apply_targeting(manager: &mut TestManager, payload: TargetingRequest) -> Result<(), LooperError> {
    if let Some(tests) = payload.tests {
        manager.set_targeted_tests(&payload.branch, tests)?;
    }
    if let Some(ids) = payload.commit_ids {
        manager.set_targeted_commit_ids(&payload.branch, ids)?;
    }
    if let Some(deep) = payload.deep_test {
        manager.set_branch_is_deep_test(&payload.branch, deep)?;
    }
    Ok(())
}
