use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::WorkbenchConfig;
use crate::evaluation::cache::{DraftRegistry, EvaluationSessionCache};
use crate::evaluation::cancel::CancellationRegistry;
use crate::evaluation::db::SqliteEvaluationStore;
use crate::evaluation::judge::{default_judge_sampling, RegexScoreParser, ScoreParser};
use crate::evaluation::store::EvaluationStore;
use crate::evaluation::{RunProgress, SamplingParams};
use crate::log_capture::LogState;
use crate::model_client::{FileAttachmentResolver, HttpModelClient, ModelClient, PassthroughResolver};
use crate::settings::{load_settings, settings_path, PersistentSettings};

pub type SharedState = Arc<WorkbenchState>;

pub struct WorkbenchState {
    pub config: WorkbenchConfig,
    pub settings: RwLock<PersistentSettings>,
    pub store: Arc<dyn EvaluationStore>,
    pub models: Arc<dyn ModelClient>,
    pub attachments: Arc<dyn FileAttachmentResolver>,
    pub score_parser: Arc<dyn ScoreParser>,
    pub cancellations: CancellationRegistry,
    pub sessions: EvaluationSessionCache,
    pub drafts: DraftRegistry,
    pub live_runs: RwLock<LiveRunsState>,
    pub logs: LogState,
}

/// Bookkeeping for runs whose orchestration task is still alive.
#[derive(Default)]
pub struct LiveRunsState {
    pub progress: HashMap<String, RunProgress>,
    /// Supervising task per background batch run.
    pub tasks: HashMap<String, JoinHandle<()>>,
}

impl WorkbenchState {
    pub fn new(
        config: WorkbenchConfig,
        store: Arc<dyn EvaluationStore>,
        models: Arc<dyn ModelClient>,
        attachments: Arc<dyn FileAttachmentResolver>,
    ) -> Self {
        let settings = load_settings(&settings_path(&config));
        Self {
            config,
            settings: RwLock::new(settings),
            store,
            models,
            attachments,
            score_parser: Arc::new(RegexScoreParser),
            cancellations: CancellationRegistry::new(),
            sessions: EvaluationSessionCache::new(),
            drafts: DraftRegistry::new(),
            live_runs: RwLock::new(LiveRunsState::default()),
            logs: LogState::new(),
        }
    }

    /// Wire the SQLite store, HTTP model client and passthrough resolver
    /// from `config`.
    pub fn from_config(config: WorkbenchConfig) -> anyhow::Result<Self> {
        let store = SqliteEvaluationStore::new(&config.db_path)?;
        let models = HttpModelClient::new(
            config.model_base_url.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let uploads = config.data_dir.join("uploads");
        let attachments = PassthroughResolver::new(uploads.display().to_string());

        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(models),
            Arc::new(attachments),
        ))
    }

    pub fn with_score_parser(mut self, parser: Arc<dyn ScoreParser>) -> Self {
        self.score_parser = parser;
        self
    }

    pub async fn judge_sampling(&self) -> SamplingParams {
        self.settings
            .read()
            .await
            .judge_sampling
            .clone()
            .unwrap_or_else(default_judge_sampling)
    }

    pub async fn default_pass_threshold(&self) -> Option<f64> {
        self.settings.read().await.default_pass_threshold
    }

    pub async fn run_progress(&self, run_id: &str) -> Option<RunProgress> {
        self.live_runs.read().await.progress.get(run_id).cloned()
    }
}
