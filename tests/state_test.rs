use std::sync::Arc;
use tempfile::TempDir;

use prompt_workbench::config::WorkbenchConfig;
use prompt_workbench::evaluation::db::SqliteEvaluationStore;
use prompt_workbench::evaluation::judge::{JudgeVerdict, ScoreParser};
use prompt_workbench::log_capture::{LogLevel, LogSource};
use prompt_workbench::model_client::{HttpModelClient, PassthroughResolver};
use prompt_workbench::settings::{save_settings, settings_path, PersistentSettings};
use prompt_workbench::state::WorkbenchState;

fn test_state(dir: &TempDir) -> WorkbenchState {
    let config = WorkbenchConfig::for_data_dir(dir.path().to_path_buf());
    let models = HttpModelClient::new(
        config.model_base_url.clone(),
        None,
        std::time::Duration::from_secs(5),
    )
    .unwrap();
    WorkbenchState::new(
        config,
        Arc::new(SqliteEvaluationStore::open_in_memory().unwrap()),
        Arc::new(models),
        Arc::new(PassthroughResolver::new("/uploads")),
    )
}

#[tokio::test]
async fn test_state_creation() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);

    // Nothing live at start
    let live = state.live_runs.read().await;
    assert!(live.progress.is_empty());
    assert!(live.tasks.is_empty());
    drop(live);

    assert_eq!(state.cancellations.live_count(), 0);
    assert_eq!(state.sessions.load_count(), 0);
    assert!(state.store.list_evaluations().unwrap().is_empty());

    // Settings fall back to defaults
    assert!(state.default_pass_threshold().await.is_none());
    assert_eq!(state.judge_sampling().await.temperature, Some(0.0));
}

#[tokio::test]
async fn test_state_loads_saved_settings() {
    let dir = TempDir::new().unwrap();
    let config = WorkbenchConfig::for_data_dir(dir.path().to_path_buf());
    save_settings(
        &settings_path(&config),
        &PersistentSettings {
            default_pass_threshold: Some(0.9),
            judge_sampling: None,
        },
    );

    let state = test_state(&dir);
    assert_eq!(state.default_pass_threshold().await, Some(0.9));
}

#[tokio::test]
async fn test_from_config_creates_database() {
    let dir = TempDir::new().unwrap();
    let config = WorkbenchConfig::for_data_dir(dir.path().join("nested"));
    let db_path = config.db_path.clone();

    let state = WorkbenchState::from_config(config).unwrap();

    assert!(db_path.exists());
    assert!(state.store.list_evaluations().unwrap().is_empty());
}

#[tokio::test]
async fn test_custom_score_parser() {
    struct Always(f64);

    impl ScoreParser for Always {
        fn parse(&self, _reply: &str) -> anyhow::Result<JudgeVerdict> {
            Ok(JudgeVerdict {
                score: self.0,
                feedback: "fixed".to_string(),
            })
        }
    }

    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).with_score_parser(Arc::new(Always(0.5)));
    let verdict = state.score_parser.parse("anything").unwrap();
    assert_eq!(verdict.score, 0.5);
}

#[tokio::test]
async fn test_log_broadcast_multiple_receivers() {
    let dir = TempDir::new().unwrap();
    let state = Arc::new(test_state(&dir));
    let mut rx1 = state.logs.subscribe();
    let mut rx2 = state.logs.subscribe();

    state
        .logs
        .emit(LogSource::Orchestrator, LogLevel::Info, "run started")
        .await;

    assert_eq!(rx1.try_recv().unwrap().message, "run started");
    assert_eq!(rx2.try_recv().unwrap().message, "run started");
    assert_eq!(state.logs.history().await.len(), 1);
}

#[tokio::test]
async fn test_draft_flags_are_per_evaluation() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);

    state.drafts.mark_dirty("eval-a");
    assert!(state.drafts.is_dirty("eval-a"));
    assert!(!state.drafts.is_dirty("eval-b"));

    state.drafts.clear("eval-a");
    assert!(!state.drafts.is_dirty("eval-a"));
}
