use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::{WorkbenchConfig, SETTINGS_FILE_NAME};
use crate::evaluation::SamplingParams;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistentSettings {
    /// Used when an evaluation leaves its pass threshold unset.
    pub default_pass_threshold: Option<f64>,
    /// Sampling parameters for every judge call.
    pub judge_sampling: Option<SamplingParams>,
}

pub fn settings_path(config: &WorkbenchConfig) -> PathBuf {
    config.data_dir.join(SETTINGS_FILE_NAME)
}

pub fn load_settings(path: &Path) -> PersistentSettings {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => PersistentSettings::default(),
    }
}

pub fn save_settings(path: &Path, settings: &PersistentSettings) {
    match serde_json::to_string_pretty(settings) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to save settings to {:?}: {}", path, e);
            }
        }
        Err(e) => {
            warn!("Failed to serialize settings: {}", e);
        }
    }
}
