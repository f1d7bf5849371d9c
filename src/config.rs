use clap::Parser;
use std::path::PathBuf;

/// Prompt Workbench: runs evaluation batches of prompts against target and judge models.
#[derive(Parser, Debug, Clone)]
#[command(name = "prompt-workbench")]
pub struct CliArgs {
    /// Directory holding the evaluation database and settings file
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// HTTP port for the API layer
    #[arg(long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Base URL of an OpenAI-compatible completion endpoint
    #[arg(
        long = "model-base-url",
        env = "WORKBENCH_MODEL_BASE_URL",
        default_value = DEFAULT_MODEL_BASE_URL
    )]
    pub model_base_url: String,

    /// API key sent as a bearer token to the completion endpoint
    #[arg(long = "api-key", env = "WORKBENCH_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Per-request timeout for model calls
    #[arg(long = "request-timeout-secs", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    /// Write a daily-rolling log file into this directory
    #[arg(short = 'l', long = "log-dir")]
    pub log_dir: Option<PathBuf>,
}

pub struct WorkbenchConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
    pub model_base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub log_dir: Option<PathBuf>,
}

// Server constants
pub const DEFAULT_PORT: u16 = 9880;
pub const DEFAULT_MODEL_BASE_URL: &str = "http://127.0.0.1:11434/v1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DB_FILE_NAME: &str = "workbench.db";
pub const SETTINGS_FILE_NAME: &str = "workbench-settings.json";

// Scoring constants
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.6;
pub const JUDGE_SCORE_MAX: f64 = 10.0;
pub const DEFAULT_JUDGE_TEMPERATURE: f64 = 0.0;

// Messages recorded on runs and results
pub const ABORTED_MESSAGE: &str = "Run aborted by user";
pub const INTERRUPTED_MESSAGE: &str = "Run interrupted by process restart";
pub const JUDGE_FAILURE_FEEDBACK: &str = "Evaluation failed";

// Log constants
pub const LOG_BUFFER_SIZE: usize = 500;

impl WorkbenchConfig {
    pub fn from_args(args: CliArgs) -> Self {
        let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
        let db_path = data_dir.join(DB_FILE_NAME);

        WorkbenchConfig {
            data_dir,
            db_path,
            port: args.port,
            model_base_url: args.model_base_url,
            api_key: args.api_key,
            request_timeout_secs: args.request_timeout_secs,
            log_dir: args.log_dir,
        }
    }

    /// Config rooted at `data_dir` with every other knob at its default.
    pub fn for_data_dir(data_dir: PathBuf) -> Self {
        WorkbenchConfig {
            db_path: data_dir.join(DB_FILE_NAME),
            data_dir,
            port: DEFAULT_PORT,
            model_base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            api_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            log_dir: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prompt-workbench")
}
