use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::WorkbenchError;
use crate::evaluation::{engine, queries, CompareReport, Run, RunProgress, RunWithResults};
use crate::state::SharedState;

#[derive(Serialize)]
pub struct RunResponse {
    #[serde(flatten)]
    pub run: RunWithResults,
    /// Present while the run's orchestration task is alive.
    pub progress: Option<RunProgress>,
}

/// GET /runs/{id}
pub async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, WorkbenchError> {
    let run = queries::get_run_with_results(state.store.as_ref(), &id)?;
    let progress = state.run_progress(&id).await;
    Ok(Json(RunResponse { run, progress }))
}

/// POST /runs/{id}/stop
pub async fn stop_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, WorkbenchError> {
    Ok(Json(engine::stop_run(&state, &id).await?))
}

/// DELETE /runs/{id}
pub async fn delete_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, WorkbenchError> {
    engine::delete_run(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /runs/{id}/compare/{baseline_id}
pub async fn compare_runs(
    State(state): State<SharedState>,
    Path((id, baseline_id)): Path<(String, String)>,
) -> Result<Json<CompareReport>, WorkbenchError> {
    Ok(Json(queries::compare_runs(
        state.store.as_ref(),
        &id,
        &baseline_id,
    )?))
}
