use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::evaluation::SamplingParams;
use crate::settings::{self, PersistentSettings};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    pub default_pass_threshold: Option<f64>,
    pub judge_sampling: Option<SamplingParams>,
}

/// GET /settings
pub async fn get_settings(State(state): State<SharedState>) -> Json<PersistentSettings> {
    Json(state.settings.read().await.clone())
}

/// PUT /settings: merge the given fields and persist.
pub async fn update_settings(
    State(state): State<SharedState>,
    Json(body): Json<SettingsUpdate>,
) -> Json<PersistentSettings> {
    let updated = {
        let mut current = state.settings.write().await;
        if let Some(threshold) = body.default_pass_threshold {
            current.default_pass_threshold = Some(threshold.clamp(0.0, 1.0));
        }
        if let Some(sampling) = body.judge_sampling {
            current.judge_sampling = Some(sampling);
        }
        current.clone()
    };

    settings::save_settings(&settings::settings_path(&state.config), &updated);
    Json(updated)
}
