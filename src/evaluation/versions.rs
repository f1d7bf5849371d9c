//! Draft edits and "submit new version".
//!
//! Every edit to an evaluation's config, test cases or criteria writes
//! through to the store, marks the evaluation dirty and drops its cached
//! detail. A dirty evaluation cannot start runs until a new version is
//! submitted.

use chrono::Utc;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use tracing::info;

use super::{
    Evaluation, EvaluationConfig, EvaluationCriterion, PromptRef, RunStatus, TestCase,
};
use crate::error::WorkbenchError;
use crate::log_capture::{LogLevel, LogSource};
use crate::state::WorkbenchState;

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EvaluationInput {
    pub name: String,
    pub model: Option<String>,
    pub judge_model: Option<String>,
    pub prompt: Option<PromptRef>,
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub config: EvaluationConfig,
}

/// Partial update; absent fields keep their current value. For the
/// optional fields, `Some(None)` (JSON `null`) clears the value.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EvaluationUpdate {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "clearable")]
    pub model: Option<Option<String>>,
    #[serde(default, deserialize_with = "clearable")]
    pub judge_model: Option<Option<String>>,
    #[serde(default, deserialize_with = "clearable")]
    pub prompt: Option<Option<PromptRef>>,
    #[serde(default, deserialize_with = "clearable")]
    pub prompt_template: Option<Option<String>>,
    pub config: Option<EvaluationConfig>,
}

// A present key, `null` included, becomes `Some`.
fn clearable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TestCaseInput {
    pub name: String,
    pub input: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub expected_output: Option<String>,
    pub notes: Option<String>,
    pub order_index: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CriterionInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Evaluations
// ============================================================================

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn require_evaluation(
    state: &WorkbenchState,
    evaluation_id: &str,
) -> Result<Evaluation, WorkbenchError> {
    state
        .store
        .get_evaluation(evaluation_id)?
        .ok_or_else(|| WorkbenchError::NotFound(format!("Evaluation '{}'", evaluation_id)))
}

async fn touch_draft(state: &WorkbenchState, evaluation_id: &str) {
    state.drafts.mark_dirty(evaluation_id);
    state.sessions.invalidate(evaluation_id).await;
}

/// A freshly created evaluation starts clean.
pub async fn create_evaluation(
    state: &WorkbenchState,
    input: EvaluationInput,
) -> Result<Evaluation, WorkbenchError> {
    let now = Utc::now().to_rfc3339();
    let evaluation = Evaluation {
        id: new_id(),
        name: input.name,
        model: input.model,
        judge_model: input.judge_model,
        prompt: input.prompt,
        prompt_template: input.prompt_template,
        config: input.config,
        status: RunStatus::Pending,
        results: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state.store.create_evaluation(&evaluation)?;
    info!("Created evaluation {} ({})", evaluation.id, evaluation.name);
    Ok(evaluation)
}

pub async fn update_evaluation(
    state: &WorkbenchState,
    evaluation_id: &str,
    update: EvaluationUpdate,
) -> Result<Evaluation, WorkbenchError> {
    let mut evaluation = require_evaluation(state, evaluation_id)?;
    if let Some(name) = update.name {
        evaluation.name = name;
    }
    if let Some(model) = update.model {
        evaluation.model = model;
    }
    if let Some(judge_model) = update.judge_model {
        evaluation.judge_model = judge_model;
    }
    if let Some(prompt) = update.prompt {
        evaluation.prompt = prompt;
    }
    if let Some(template) = update.prompt_template {
        evaluation.prompt_template = template;
    }
    if let Some(config) = update.config {
        evaluation.config = config;
    }
    evaluation.updated_at = Utc::now().to_rfc3339();

    state.store.update_evaluation(&evaluation)?;
    touch_draft(state, evaluation_id).await;
    Ok(evaluation)
}

/// Delete an evaluation with its test cases, criteria, runs and results.
/// Live runs of the evaluation are signalled to stop.
pub async fn delete_evaluation(
    state: &WorkbenchState,
    evaluation_id: &str,
) -> Result<(), WorkbenchError> {
    let live: Vec<String> = state
        .live_runs
        .read()
        .await
        .progress
        .values()
        .filter(|p| p.evaluation_id == evaluation_id)
        .map(|p| p.run_id.clone())
        .collect();
    for run_id in &live {
        state.cancellations.abort(run_id);
        state.cancellations.release(run_id);
    }

    if !state.store.delete_evaluation(evaluation_id)? {
        return Err(WorkbenchError::NotFound(format!(
            "Evaluation '{}'",
            evaluation_id
        )));
    }
    state.drafts.clear(evaluation_id);
    state.sessions.invalidate(evaluation_id).await;

    state
        .logs
        .emit(
            LogSource::Store,
            LogLevel::Info,
            format!("Deleted evaluation {}", evaluation_id),
        )
        .await;
    Ok(())
}

/// Copy the current draft into a new evaluation and clear the source's
/// dirty flag. The copy gets fresh ids for itself, its test cases and its
/// criteria; runs are not copied.
pub async fn submit_new_version(
    state: &WorkbenchState,
    source_id: &str,
    name: Option<String>,
) -> Result<Evaluation, WorkbenchError> {
    let source = require_evaluation(state, source_id)?;
    let test_cases = state.store.list_test_cases(source_id)?;
    let criteria = state.store.list_criteria(source_id)?;

    let now = Utc::now().to_rfc3339();
    let copy = Evaluation {
        id: new_id(),
        name: name.unwrap_or_else(|| source.name.clone()),
        status: RunStatus::Pending,
        results: None,
        created_at: now.clone(),
        updated_at: now,
        ..source
    };
    state.store.create_evaluation(&copy)?;

    for test_case in test_cases {
        state.store.create_test_case(&TestCase {
            id: new_id(),
            evaluation_id: copy.id.clone(),
            ..test_case
        })?;
    }
    for criterion in criteria {
        state.store.create_criterion(&EvaluationCriterion {
            id: new_id(),
            evaluation_id: copy.id.clone(),
            ..criterion
        })?;
    }

    state.drafts.clear(source_id);
    state.sessions.invalidate(source_id).await;

    state
        .logs
        .emit(
            LogSource::Store,
            LogLevel::Info,
            format!("Submitted evaluation {} as new version {}", source_id, copy.id),
        )
        .await;
    Ok(copy)
}

// ============================================================================
// Test cases
// ============================================================================

fn require_test_case(
    state: &WorkbenchState,
    evaluation_id: &str,
    test_case_id: &str,
) -> Result<TestCase, WorkbenchError> {
    state
        .store
        .get_test_case(test_case_id)?
        .filter(|tc| tc.evaluation_id == evaluation_id)
        .ok_or_else(|| WorkbenchError::NotFound(format!("Test case '{}'", test_case_id)))
}

pub async fn add_test_case(
    state: &WorkbenchState,
    evaluation_id: &str,
    input: TestCaseInput,
) -> Result<TestCase, WorkbenchError> {
    require_evaluation(state, evaluation_id)?;
    let order_index = match input.order_index {
        Some(index) => index,
        None => state.store.list_test_cases(evaluation_id)?.len() as i64,
    };

    let test_case = TestCase {
        id: new_id(),
        evaluation_id: evaluation_id.to_string(),
        name: input.name,
        input: input.input,
        variables: input.variables,
        attachments: input.attachments,
        expected_output: input.expected_output,
        notes: input.notes,
        order_index,
    };
    state.store.create_test_case(&test_case)?;
    touch_draft(state, evaluation_id).await;
    Ok(test_case)
}

pub async fn update_test_case(
    state: &WorkbenchState,
    evaluation_id: &str,
    test_case_id: &str,
    input: TestCaseInput,
) -> Result<TestCase, WorkbenchError> {
    let current = require_test_case(state, evaluation_id, test_case_id)?;
    let test_case = TestCase {
        name: input.name,
        input: input.input,
        variables: input.variables,
        attachments: input.attachments,
        expected_output: input.expected_output,
        notes: input.notes,
        order_index: input.order_index.unwrap_or(current.order_index),
        ..current
    };
    state.store.update_test_case(&test_case)?;
    touch_draft(state, evaluation_id).await;
    Ok(test_case)
}

pub async fn delete_test_case(
    state: &WorkbenchState,
    evaluation_id: &str,
    test_case_id: &str,
) -> Result<(), WorkbenchError> {
    require_test_case(state, evaluation_id, test_case_id)?;
    state.store.delete_test_case(test_case_id)?;
    touch_draft(state, evaluation_id).await;
    Ok(())
}

// ============================================================================
// Criteria
// ============================================================================

fn require_criterion(
    state: &WorkbenchState,
    evaluation_id: &str,
    criterion_id: &str,
) -> Result<EvaluationCriterion, WorkbenchError> {
    state
        .store
        .list_criteria(evaluation_id)?
        .into_iter()
        .find(|c| c.id == criterion_id)
        .ok_or_else(|| WorkbenchError::NotFound(format!("Criterion '{}'", criterion_id)))
}

pub async fn add_criterion(
    state: &WorkbenchState,
    evaluation_id: &str,
    input: CriterionInput,
) -> Result<EvaluationCriterion, WorkbenchError> {
    require_evaluation(state, evaluation_id)?;
    let criterion = EvaluationCriterion {
        id: new_id(),
        evaluation_id: evaluation_id.to_string(),
        name: input.name,
        description: input.description,
        prompt: input.prompt,
        weight: input.weight.max(0.0),
        enabled: input.enabled,
    };
    state.store.create_criterion(&criterion)?;
    touch_draft(state, evaluation_id).await;
    Ok(criterion)
}

pub async fn update_criterion(
    state: &WorkbenchState,
    evaluation_id: &str,
    criterion_id: &str,
    input: CriterionInput,
) -> Result<EvaluationCriterion, WorkbenchError> {
    let current = require_criterion(state, evaluation_id, criterion_id)?;
    let criterion = EvaluationCriterion {
        name: input.name,
        description: input.description,
        prompt: input.prompt,
        weight: input.weight.max(0.0),
        enabled: input.enabled,
        ..current
    };
    state.store.update_criterion(&criterion)?;
    touch_draft(state, evaluation_id).await;
    Ok(criterion)
}

pub async fn delete_criterion(
    state: &WorkbenchState,
    evaluation_id: &str,
    criterion_id: &str,
) -> Result<(), WorkbenchError> {
    require_criterion(state, evaluation_id, criterion_id)?;
    state.store.delete_criterion(criterion_id)?;
    touch_draft(state, evaluation_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkbenchConfig;
    use crate::error::ProviderError;
    use crate::evaluation::cache::load_detail;
    use crate::evaluation::db::SqliteEvaluationStore;
    use crate::evaluation::SamplingParams;
    use crate::model_client::{ChatMessage, Completion, ModelClient, PassthroughResolver};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl ModelClient for Unreachable {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _params: &SamplingParams,
        ) -> Result<Completion, ProviderError> {
            Err(ProviderError::Transport("offline".to_string()))
        }
    }

    fn state() -> WorkbenchState {
        WorkbenchState::new(
            WorkbenchConfig::for_data_dir(std::env::temp_dir().join("workbench-versions-test")),
            Arc::new(SqliteEvaluationStore::open_in_memory().unwrap()),
            Arc::new(Unreachable),
            Arc::new(PassthroughResolver::new("/uploads")),
        )
    }

    async fn evaluation(state: &WorkbenchState) -> Evaluation {
        create_evaluation(
            state,
            EvaluationInput {
                name: "Tickets".to_string(),
                model: Some("m".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    fn criterion(name: &str) -> CriterionInput {
        CriterionInput {
            name: name.to_string(),
            description: String::new(),
            prompt: "Rate {{output}}".to_string(),
            weight: -2.0,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_edits_mark_dirty_and_drop_cache() {
        let state = state();
        let eval = evaluation(&state).await;
        assert!(!state.drafts.is_dirty(&eval.id));

        let store = state.store.clone();
        let id = eval.id.clone();
        state
            .sessions
            .get_or_load(&eval.id, move || async move { load_detail(store.as_ref(), &id) })
            .await
            .unwrap();

        update_evaluation(
            &state,
            &eval.id,
            EvaluationUpdate {
                judge_model: Some(Some("judge".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(state.drafts.is_dirty(&eval.id));
        assert!(state.sessions.get(&eval.id).await.is_none());
        let stored = state.store.get_evaluation(&eval.id).unwrap().unwrap();
        assert_eq!(stored.judge_model.as_deref(), Some("judge"));
        assert_eq!(stored.model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_null_clears_optional_fields() {
        let state = state();
        let eval = evaluation(&state).await;
        let set: EvaluationUpdate = serde_json::from_value(serde_json::json!({
            "judge_model": "judge",
            "prompt_template": "Q: {{input}}",
        }))
        .unwrap();
        update_evaluation(&state, &eval.id, set).await.unwrap();

        let clear: EvaluationUpdate = serde_json::from_value(serde_json::json!({
            "judge_model": null,
        }))
        .unwrap();
        assert_eq!(clear.judge_model, Some(None));
        assert!(clear.prompt_template.is_none());
        let updated = update_evaluation(&state, &eval.id, clear).await.unwrap();

        assert!(updated.judge_model.is_none());
        assert_eq!(updated.prompt_template.as_deref(), Some("Q: {{input}}"));
        assert_eq!(updated.model.as_deref(), Some("m"));
        let stored = state.store.get_evaluation(&eval.id).unwrap().unwrap();
        assert!(stored.judge_model.is_none());
    }

    #[tokio::test]
    async fn test_appended_cases_get_next_order_index() {
        let state = state();
        let eval = evaluation(&state).await;
        for name in ["first", "second"] {
            add_test_case(
                &state,
                &eval.id,
                TestCaseInput {
                    name: name.to_string(),
                    input: name.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let cases = state.store.list_test_cases(&eval.id).unwrap();
        assert_eq!(cases[0].order_index, 0);
        assert_eq!(cases[1].order_index, 1);
    }

    #[tokio::test]
    async fn test_criterion_weight_is_never_negative() {
        let state = state();
        let eval = evaluation(&state).await;
        let created = add_criterion(&state, &eval.id, criterion("tone"))
            .await
            .unwrap();
        assert_eq!(created.weight, 0.0);
    }

    #[tokio::test]
    async fn test_items_of_other_evaluations_are_not_found() {
        let state = state();
        let first = evaluation(&state).await;
        let second = evaluation(&state).await;
        let created = add_criterion(&state, &first.id, criterion("tone"))
            .await
            .unwrap();

        let err = delete_criterion(&state, &second.id, &created.id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkbenchError::NotFound(_)));
        assert_eq!(state.store.list_criteria(&first.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_evaluation_is_not_found() {
        let state = state();
        assert!(matches!(
            delete_evaluation(&state, "missing").await,
            Err(WorkbenchError::NotFound(_))
        ));
    }
}
