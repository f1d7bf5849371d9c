use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub live_runs: usize,
    pub live_tokens: usize,
    pub data_dir: String,
    pub model_base_url: String,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(build_health_response(&state).await)
}

pub async fn build_health_response(state: &SharedState) -> HealthResponse {
    let live_runs = state.live_runs.read().await.progress.len();

    HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_runs,
        live_tokens: state.cancellations.live_count(),
        data_dir: state.config.data_dir.display().to_string(),
        model_base_url: state.config.model_base_url.clone(),
    }
}
