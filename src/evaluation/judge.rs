use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::template::render_criterion_prompt;
use super::{CriterionFeedback, CriterionScores, EvaluationCriterion, SamplingParams, TestCase};
use crate::config::{DEFAULT_JUDGE_TEMPERATURE, JUDGE_FAILURE_FEEDBACK, JUDGE_SCORE_MAX};
use crate::model_client::{ChatMessage, ModelClient};

static SCORE_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{[\s\S]*?"score"[\s\S]*?\}"#).unwrap());

/// A judge's verdict on one criterion, score normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub score: f64,
    pub feedback: String,
}

/// Turns a judge reply into a verdict.
///
/// Swappable so a structured-output provider can replace the free-text
/// extraction without touching the run engine.
pub trait ScoreParser: Send + Sync {
    fn parse(&self, reply: &str) -> anyhow::Result<JudgeVerdict>;
}

/// Pulls the first `{ ... "score" ... }` object out of free text.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexScoreParser;

impl ScoreParser for RegexScoreParser {
    fn parse(&self, reply: &str) -> anyhow::Result<JudgeVerdict> {
        let found = SCORE_OBJECT.find(reply).ok_or_else(|| {
            anyhow::anyhow!(
                "No score object in judge reply: {}",
                reply.chars().take(100).collect::<String>()
            )
        })?;

        let value: serde_json::Value = serde_json::from_str(found.as_str())?;
        let raw = match &value["score"] {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|score| score.is_finite())
        .ok_or_else(|| anyhow::anyhow!("Judge score is not a number: {}", value["score"]))?;

        let feedback = value["reason"].as_str().unwrap_or_default().to_string();

        Ok(JudgeVerdict {
            score: raw.clamp(0.0, JUDGE_SCORE_MAX) / JUDGE_SCORE_MAX,
            feedback,
        })
    }
}

/// Sampling for judge calls when settings leave it unset.
pub fn default_judge_sampling() -> SamplingParams {
    SamplingParams {
        temperature: Some(DEFAULT_JUDGE_TEMPERATURE),
        ..Default::default()
    }
}

/// Everything the judge needs besides the case under test.
pub struct Judge<'a> {
    pub models: &'a dyn ModelClient,
    pub parser: &'a dyn ScoreParser,
    pub model: &'a str,
    pub sampling: &'a SamplingParams,
}

impl Judge<'_> {
    /// Score one criterion against the target model's output.
    pub async fn score_criterion(
        &self,
        criterion: &EvaluationCriterion,
        test_case: &TestCase,
        output: &str,
    ) -> anyhow::Result<JudgeVerdict> {
        let prompt = render_criterion_prompt(
            &criterion.prompt,
            &test_case.input,
            output,
            test_case.expected_output.as_deref(),
        );

        let completion = self
            .models
            .complete(self.model, &[ChatMessage::user(prompt)], self.sampling)
            .await?;
        debug!(
            "Judge reply for '{}' in {}ms",
            criterion.name, completion.latency_ms
        );

        self.parser.parse(&completion.content)
    }

    /// Score every enabled criterion in order.
    ///
    /// A criterion that fails is recorded as `0` with the failure marker;
    /// the remaining criteria are still scored.
    pub async fn score_all(
        &self,
        criteria: &[EvaluationCriterion],
        test_case: &TestCase,
        output: &str,
    ) -> (CriterionScores, CriterionFeedback) {
        let mut scores = CriterionScores::new();
        let mut feedback = CriterionFeedback::new();

        for criterion in criteria.iter().filter(|c| c.enabled) {
            match self.score_criterion(criterion, test_case, output).await {
                Ok(verdict) => {
                    scores.insert(criterion.name.clone(), verdict.score);
                    feedback.insert(criterion.name.clone(), verdict.feedback);
                }
                Err(e) => {
                    warn!(
                        "Judge failed on criterion '{}' for test case '{}': {}",
                        criterion.name, test_case.id, e
                    );
                    scores.insert(criterion.name.clone(), 0.0);
                    feedback.insert(criterion.name.clone(), JUDGE_FAILURE_FEEDBACK.to_string());
                }
            }
        }

        (scores, feedback)
    }
}
