use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes::{evaluations, health, logs, runs, settings};
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health::health))
        // Evaluations
        .route(
            "/evaluations",
            get(evaluations::list_evaluations).post(evaluations::create_evaluation),
        )
        .route(
            "/evaluations/{id}",
            get(evaluations::get_evaluation).delete(evaluations::delete_evaluation),
        )
        .route("/evaluations/{id}/config", put(evaluations::update_evaluation))
        .route(
            "/evaluations/{id}/versions",
            post(evaluations::submit_new_version),
        )
        // Draft edits
        .route(
            "/evaluations/{id}/test-cases",
            post(evaluations::add_test_case),
        )
        .route(
            "/evaluations/{id}/test-cases/{case_id}",
            put(evaluations::update_test_case).delete(evaluations::delete_test_case),
        )
        .route("/evaluations/{id}/criteria", post(evaluations::add_criterion))
        .route(
            "/evaluations/{id}/criteria/{criterion_id}",
            put(evaluations::update_criterion).delete(evaluations::delete_criterion),
        )
        // Runs
        .route(
            "/evaluations/{id}/runs",
            get(evaluations::list_runs).post(evaluations::start_batch_run),
        )
        .route(
            "/evaluations/{id}/runs/{run_id}/select",
            post(evaluations::select_run),
        )
        .route(
            "/evaluations/{id}/test-cases/{case_id}/run",
            post(evaluations::start_single_case_run),
        )
        .route("/runs/{id}", get(runs::get_run).delete(runs::delete_run))
        .route("/runs/{id}/stop", post(runs::stop_run))
        .route(
            "/runs/{id}/compare/{baseline_id}",
            get(runs::compare_runs),
        )
        // Settings
        .route(
            "/settings",
            get(settings::get_settings).put(settings::update_settings),
        )
        // Logs
        .route("/logs/history", get(logs::log_history))
        .route("/logs/stream", get(logs::log_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
