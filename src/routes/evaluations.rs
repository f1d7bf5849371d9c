use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::WorkbenchError;
use crate::evaluation::cache::{load_detail, EvaluationDetail};
use crate::evaluation::versions::{
    self, CriterionInput, EvaluationInput, EvaluationUpdate, TestCaseInput,
};
use crate::evaluation::{
    engine, queries, Evaluation, EvaluationCriterion, Run, RunWithResults, TestCase,
};
use crate::state::SharedState;

#[derive(Serialize)]
pub struct DetailResponse {
    #[serde(flatten)]
    pub detail: EvaluationDetail,
    pub dirty: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct NewVersionRequest {
    pub name: Option<String>,
}

// ============================================================================
// Evaluations
// ============================================================================

async fn cached_detail(
    state: &SharedState,
    id: &str,
) -> Result<Arc<EvaluationDetail>, WorkbenchError> {
    let store = state.store.clone();
    let loader_id = id.to_string();
    state
        .sessions
        .get_or_load(id, move || async move {
            load_detail(store.as_ref(), &loader_id)
        })
        .await
}

/// GET /evaluations
pub async fn list_evaluations(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Evaluation>>, WorkbenchError> {
    Ok(Json(state.store.list_evaluations()?))
}

/// POST /evaluations
pub async fn create_evaluation(
    State(state): State<SharedState>,
    Json(body): Json<EvaluationInput>,
) -> Result<(StatusCode, Json<Evaluation>), WorkbenchError> {
    let evaluation = versions::create_evaluation(&state, body).await?;
    Ok((StatusCode::CREATED, Json(evaluation)))
}

/// GET /evaluations/{id}: cached detail plus the draft flag.
pub async fn get_evaluation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<DetailResponse>, WorkbenchError> {
    let detail = cached_detail(&state, &id).await?;

    Ok(Json(DetailResponse {
        detail: (*detail).clone(),
        dirty: state.drafts.is_dirty(&id),
    }))
}

/// PUT /evaluations/{id}/config
pub async fn update_evaluation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<EvaluationUpdate>,
) -> Result<Json<Evaluation>, WorkbenchError> {
    Ok(Json(versions::update_evaluation(&state, &id, body).await?))
}

/// DELETE /evaluations/{id}
pub async fn delete_evaluation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, WorkbenchError> {
    versions::delete_evaluation(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /evaluations/{id}/versions
pub async fn submit_new_version(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<NewVersionRequest>,
) -> Result<(StatusCode, Json<Evaluation>), WorkbenchError> {
    let copy = versions::submit_new_version(&state, &id, body.name).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

// ============================================================================
// Test cases and criteria
// ============================================================================

/// POST /evaluations/{id}/test-cases
pub async fn add_test_case(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<TestCaseInput>,
) -> Result<(StatusCode, Json<TestCase>), WorkbenchError> {
    let test_case = versions::add_test_case(&state, &id, body).await?;
    Ok((StatusCode::CREATED, Json(test_case)))
}

/// PUT /evaluations/{id}/test-cases/{case_id}
pub async fn update_test_case(
    State(state): State<SharedState>,
    Path((id, case_id)): Path<(String, String)>,
    Json(body): Json<TestCaseInput>,
) -> Result<Json<TestCase>, WorkbenchError> {
    Ok(Json(
        versions::update_test_case(&state, &id, &case_id, body).await?,
    ))
}

/// DELETE /evaluations/{id}/test-cases/{case_id}
pub async fn delete_test_case(
    State(state): State<SharedState>,
    Path((id, case_id)): Path<(String, String)>,
) -> Result<StatusCode, WorkbenchError> {
    versions::delete_test_case(&state, &id, &case_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /evaluations/{id}/criteria
pub async fn add_criterion(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<CriterionInput>,
) -> Result<(StatusCode, Json<EvaluationCriterion>), WorkbenchError> {
    let criterion = versions::add_criterion(&state, &id, body).await?;
    Ok((StatusCode::CREATED, Json(criterion)))
}

/// PUT /evaluations/{id}/criteria/{criterion_id}
pub async fn update_criterion(
    State(state): State<SharedState>,
    Path((id, criterion_id)): Path<(String, String)>,
    Json(body): Json<CriterionInput>,
) -> Result<Json<EvaluationCriterion>, WorkbenchError> {
    Ok(Json(
        versions::update_criterion(&state, &id, &criterion_id, body).await?,
    ))
}

/// DELETE /evaluations/{id}/criteria/{criterion_id}
pub async fn delete_criterion(
    State(state): State<SharedState>,
    Path((id, criterion_id)): Path<(String, String)>,
) -> Result<StatusCode, WorkbenchError> {
    versions::delete_criterion(&state, &id, &criterion_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Runs of an evaluation
// ============================================================================

/// GET /evaluations/{id}/runs
pub async fn list_runs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Run>>, WorkbenchError> {
    Ok(Json(queries::list_runs(state.store.as_ref(), &id)?))
}

/// POST /evaluations/{id}/runs: start a batch run in the background.
pub async fn start_batch_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Run>), WorkbenchError> {
    let run = engine::start_batch_run(&state, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// POST /evaluations/{id}/test-cases/{case_id}/run: run one case and wait
/// for it to finish.
pub async fn start_single_case_run(
    State(state): State<SharedState>,
    Path((id, case_id)): Path<(String, String)>,
) -> Result<Json<RunWithResults>, WorkbenchError> {
    Ok(Json(
        engine::start_single_case_run(&state, &id, &case_id).await?,
    ))
}

/// POST /evaluations/{id}/runs/{run_id}/select: show another run in the
/// cached detail.
pub async fn select_run(
    State(state): State<SharedState>,
    Path((id, run_id)): Path<(String, String)>,
) -> Result<Json<DetailResponse>, WorkbenchError> {
    cached_detail(&state, &id).await?;

    let detail = state
        .sessions
        .select_run(state.store.as_ref(), &id, &run_id)
        .await?
        .ok_or_else(|| WorkbenchError::NotFound(format!("Run '{}'", run_id)))?;

    Ok(Json(DetailResponse {
        detail: (*detail).clone(),
        dirty: state.drafts.is_dirty(&id),
    }))
}
