pub mod cache;
pub mod cancel;
pub mod db;
pub mod engine;
pub mod judge;
pub mod queries;
pub mod scoring;
pub mod store;
pub mod template;
pub mod versions;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Judge scores keyed by criterion name, normalized to `[0, 1]`.
pub type CriterionScores = BTreeMap<String, f64>;

/// Judge feedback keyed by criterion name.
pub type CriterionFeedback = BTreeMap<String, String>;

// ============================================================================
// Shared data model structs
// ============================================================================

/// Lifecycle of both runs and the evaluations that mirror them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// How file attachments reach the target model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileProcessingMode {
    /// Attach the resolved file reference as a message part.
    #[default]
    Native,
    /// Append text extracted by the OCR provider to the user message.
    Ocr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvaluationConfig {
    pub pass_threshold: Option<f64>,
    #[serde(default)]
    pub file_processing: FileProcessingMode,
    pub ocr_provider: Option<String>,
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Take template and sampling from the linked prompt instead of this config.
    #[serde(default)]
    pub inherit_from_prompt: bool,
}

/// Snapshot of the prompt an evaluation is linked to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRef {
    pub id: String,
    pub template: Option<String>,
    pub sampling: Option<SamplingParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub name: String,
    /// Target model identifier.
    pub model: Option<String>,
    pub judge_model: Option<String>,
    pub prompt: Option<PromptRef>,
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub config: EvaluationConfig,
    #[serde(default)]
    pub status: RunStatus,
    pub results: Option<RunResults>,
    pub created_at: String,
    pub updated_at: String,
}

impl Evaluation {
    /// Template used to build the target-model message.
    pub fn effective_template(&self) -> Option<&str> {
        if self.config.inherit_from_prompt {
            if let Some(template) = self.prompt.as_ref().and_then(|p| p.template.as_deref()) {
                return Some(template);
            }
        }
        self.prompt_template.as_deref()
    }

    /// Sampling parameters used for the target model.
    pub fn effective_sampling(&self) -> SamplingParams {
        if self.config.inherit_from_prompt {
            if let Some(sampling) = self.prompt.as_ref().and_then(|p| p.sampling.clone()) {
                return sampling;
            }
        }
        self.config.sampling.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub evaluation_id: String,
    pub name: String,
    pub input: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Opaque file ids resolved through the attachment resolver.
    #[serde(default)]
    pub attachments: Vec<String>,
    pub expected_output: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationCriterion {
    pub id: String,
    pub evaluation_id: String,
    pub name: String,
    pub description: String,
    /// Judge prompt; may use `{{input}}`, `{{output}}`, `{{expected}}` and
    /// `{{#expected}}...{{/expected}}`.
    pub prompt: String,
    pub weight: f64,
    pub enabled: bool,
}

/// Run-level aggregate, also mirrored onto the owning evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunResults {
    /// Mean normalized score per criterion name.
    pub criterion_scores: CriterionScores,
    pub total_cases: usize,
    pub passed_cases: usize,
    /// Rounded percentage of passed cases.
    pub pass_rate: u32,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub evaluation_id: String,
    pub status: RunStatus,
    pub results: Option<RunResults>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub started_at: String,
    /// Set if and only if the status is terminal.
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub sampling: Option<SamplingParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub id: String,
    pub run_id: String,
    pub test_case_id: String,
    /// Copy of the message text sent to the target model.
    pub input: String,
    pub output: String,
    pub scores: CriterionScores,
    pub feedback: CriterionFeedback,
    /// Weighted average across scored criteria.
    pub score: f64,
    pub latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub passed: bool,
    pub error: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWithResults {
    #[serde(flatten)]
    pub run: Run,
    /// Serialized apart from the run's own `results` summary.
    #[serde(rename = "case_results")]
    pub results: Vec<TestCaseResult>,
}

/// In-memory progress of a live run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: String,
    pub evaluation_id: String,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareReport {
    pub current_run_id: String,
    pub baseline_run_id: String,
    pub per_case: Vec<CaseComparison>,
    pub aggregate: AggregateDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseComparison {
    pub test_case_id: String,
    pub baseline_score: Option<f64>,
    pub current_score: Option<f64>,
    pub delta: Option<f64>,
    pub regression: bool,
    pub improvement: bool,
    pub criterion_deltas: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateDelta {
    pub avg_score_delta: Option<f64>,
    pub pass_rate_delta: i64,
    pub regressions: usize,
    pub improvements: usize,
    pub unchanged: usize,
}
