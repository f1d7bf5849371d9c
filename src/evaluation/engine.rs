use chrono::Utc;
use std::future::Future;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::cancel::CancelToken;
use super::judge::Judge;
use super::queries::get_run_with_results;
use super::scoring::{is_passed, pass_threshold, summarize_run, weighted_score};
use super::template::render_prompt;
use super::{
    CriterionFeedback, CriterionScores, Evaluation, EvaluationCriterion, Run, RunProgress,
    RunStatus, RunWithResults, SamplingParams, TestCase, TestCaseResult,
};
use crate::config::{ABORTED_MESSAGE, JUDGE_FAILURE_FEEDBACK};
use crate::error::{ProviderError, ValidationError, WorkbenchError};
use crate::log_capture::{LogLevel, LogSource};
use crate::model_client::attachments::build_user_message;
use crate::state::{SharedState, WorkbenchState};

/// A run that passed validation and is already `running`, not yet executed.
pub struct PreparedRun {
    run: Run,
    evaluation: Evaluation,
    test_cases: Vec<TestCase>,
    criteria: Vec<EvaluationCriterion>,
    token: CancelToken,
}

impl PreparedRun {
    pub fn run(&self) -> &Run {
        &self.run
    }

    /// Execute every test case in order, then finalize. Always leaves the
    /// run terminal.
    pub async fn execute(self, state: &WorkbenchState) -> RunWithResults {
        let PreparedRun {
            run,
            evaluation,
            test_cases,
            criteria,
            token,
        } = self;

        let threshold = pass_threshold(
            evaluation
                .config
                .pass_threshold
                .or(state.default_pass_threshold().await),
        );
        let judge_sampling = state.judge_sampling().await;
        let target_sampling = evaluation.effective_sampling();
        let ctx = CaseContext {
            state,
            evaluation: &evaluation,
            criteria: &criteria,
            target_sampling: &target_sampling,
            judge_sampling: &judge_sampling,
            threshold,
        };

        let total = test_cases.len();
        let mut results = Vec::with_capacity(total);
        for (i, test_case) in test_cases.iter().enumerate() {
            if token.is_aborted() {
                info!("Run {} stopped before case {}/{}", run.id, i + 1, total);
                break;
            }

            info!(
                "Run {}: executing case {}/{} '{}'",
                run.id,
                i + 1,
                total,
                test_case.name
            );
            let result = execute_case(&ctx, &run.id, test_case).await;

            let result = match state.store.append_result(&run.id, &result) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(
                        "Failed to persist result for case {} of run {}: {}",
                        test_case.id, run.id, e
                    );
                    result
                }
            };
            results.push(result);

            if let Some(progress) = state.live_runs.write().await.progress.get_mut(&run.id) {
                progress.completed = i + 1;
            }
        }

        let run = finalize_run(state, run, &evaluation.id, &token, &results).await;
        RunWithResults { run, results }
    }
}

// ============================================================================
// Validation and run creation
// ============================================================================

fn require_evaluation(
    state: &WorkbenchState,
    evaluation_id: &str,
) -> Result<Evaluation, WorkbenchError> {
    state
        .store
        .get_evaluation(evaluation_id)?
        .ok_or_else(|| ValidationError::EvaluationNotFound(evaluation_id.to_string()).into())
}

fn check_runnable(state: &WorkbenchState, evaluation: &Evaluation) -> Result<(), ValidationError> {
    if evaluation.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
        return Err(ValidationError::MissingModel);
    }
    if state.drafts.is_dirty(&evaluation.id) {
        return Err(ValidationError::DirtyDraft);
    }
    Ok(())
}

/// Validate a batch run and move it to `running`.
///
/// Validation failures are returned before any run exists.
pub async fn prepare_batch_run(
    state: &WorkbenchState,
    evaluation_id: &str,
) -> Result<PreparedRun, WorkbenchError> {
    let evaluation = require_evaluation(state, evaluation_id)?;
    check_runnable(state, &evaluation)?;

    let test_cases = state.store.list_test_cases(evaluation_id)?;
    if test_cases.is_empty() {
        return Err(ValidationError::NoTestCases.into());
    }
    let criteria = state.store.list_criteria(evaluation_id)?;

    begin_run(state, evaluation, test_cases, criteria).await
}

async fn begin_run(
    state: &WorkbenchState,
    mut evaluation: Evaluation,
    test_cases: Vec<TestCase>,
    criteria: Vec<EvaluationCriterion>,
) -> Result<PreparedRun, WorkbenchError> {
    let sampling = evaluation.effective_sampling();
    let mut run = state.store.create_run(&evaluation.id, Some(&sampling))?;
    let token = state.cancellations.create(&run.id);

    run.status = RunStatus::Running;
    evaluation.status = RunStatus::Running;
    evaluation.updated_at = Utc::now().to_rfc3339();
    let promoted = state
        .store
        .update_run(&run)
        .and_then(|_| state.store.update_evaluation(&evaluation));
    if let Err(e) = promoted {
        state.cancellations.release(&run.id);
        return Err(e.into());
    }

    state.live_runs.write().await.progress.insert(
        run.id.clone(),
        RunProgress {
            run_id: run.id.clone(),
            evaluation_id: evaluation.id.clone(),
            completed: 0,
            total: test_cases.len(),
        },
    );
    state.sessions.invalidate(&evaluation.id).await;

    state
        .logs
        .emit(
            LogSource::Orchestrator,
            LogLevel::Info,
            format!(
                "Run {} started for evaluation {} ({} test cases)",
                run.id,
                evaluation.id,
                test_cases.len()
            ),
        )
        .await;

    Ok(PreparedRun {
        run,
        evaluation,
        test_cases,
        criteria,
        token,
    })
}

// ============================================================================
// Entry points
// ============================================================================

/// Start a batch run in the background and return it as soon as it is
/// `running`. Completion is observed through the stored run.
pub async fn start_batch_run(
    state: &SharedState,
    evaluation_id: &str,
) -> Result<Run, WorkbenchError> {
    let state = state.clone();
    let evaluation_id = evaluation_id.to_string();
    detached(async move {
        let prepared = prepare_batch_run(&state, &evaluation_id).await?;
        let run = prepared.run.clone();
        spawn_supervised(&state, prepared).await;
        Ok(run)
    })
    .await
}

/// Run `setup` on its own task. Dropping the caller cannot stop it between
/// creating a run and handing the run to its supervisor.
async fn detached<T, F>(setup: F) -> Result<T, WorkbenchError>
where
    F: Future<Output = Result<T, WorkbenchError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(setup)
        .await
        .map_err(|e| WorkbenchError::Other(format!("Run setup failed: {}", e)))?
}

/// Execute a prepared run on its own task, watched by a supervisor that
/// fails the run if the task dies. The receiver yields the outcome when
/// the run finished normally.
async fn spawn_supervised(
    state: &SharedState,
    prepared: PreparedRun,
) -> oneshot::Receiver<RunWithResults> {
    let run_id = prepared.run.id.clone();
    let evaluation_id = prepared.evaluation.id.clone();
    let (done_tx, done_rx) = oneshot::channel();

    let worker_state = state.clone();
    let worker = tokio::spawn(async move { prepared.execute(&worker_state).await });

    // Held across the spawn so the supervisor cannot deregister first.
    let mut live = state.live_runs.write().await;
    let supervisor_state = state.clone();
    let task_run_id = run_id.clone();
    let supervisor = tokio::spawn(async move {
        match worker.await {
            Ok(outcome) => {
                let _ = done_tx.send(outcome);
            }
            Err(e) => {
                error!("Run {} task ended abnormally: {}", task_run_id, e);
                fail_crashed_run(&supervisor_state, &task_run_id, &evaluation_id, &e.to_string())
                    .await;
            }
        }
        supervisor_state
            .live_runs
            .write()
            .await
            .tasks
            .remove(&task_run_id);
    });
    live.tasks.insert(run_id, supervisor);
    done_rx
}

/// Wait for a background run's task to finish. Returns immediately if the
/// run has no live task.
pub async fn wait_for_run(state: &WorkbenchState, run_id: &str) {
    let handle = state.live_runs.write().await.tasks.remove(run_id);
    if let Some(handle) = handle {
        let _ = handle.await;
    }
}

/// Run one test case of an evaluation and return once the run is terminal.
///
/// The case runs on a supervised task, so a caller that goes away mid-call
/// or a crash in the case still leaves the run terminal.
pub async fn start_single_case_run(
    state: &SharedState,
    evaluation_id: &str,
    test_case_id: &str,
) -> Result<RunWithResults, WorkbenchError> {
    let state = state.clone();
    let evaluation_id = evaluation_id.to_string();
    let test_case_id = test_case_id.to_string();
    detached(async move { run_single_case(&state, &evaluation_id, &test_case_id).await }).await
}

async fn run_single_case(
    state: &SharedState,
    evaluation_id: &str,
    test_case_id: &str,
) -> Result<RunWithResults, WorkbenchError> {
    let evaluation = require_evaluation(state, evaluation_id)?;
    check_runnable(state, &evaluation)?;

    let test_case = state
        .store
        .get_test_case(test_case_id)?
        .filter(|tc| tc.evaluation_id == evaluation_id)
        .ok_or_else(|| ValidationError::TestCaseNotFound(test_case_id.to_string()))?;
    let criteria = state.store.list_criteria(evaluation_id)?;

    let prepared = begin_run(state, evaluation, vec![test_case], criteria).await?;
    let run_id = prepared.run.id.clone();
    let done = spawn_supervised(state, prepared).await;

    match done.await {
        Ok(outcome) => Ok(outcome),
        // Crashed; the supervisor failed the run before dropping the sender.
        Err(_) => get_run_with_results(state.store.as_ref(), &run_id),
    }
}

/// Signal a live run to stop and record it as failed right away.
///
/// A case already in flight finishes; no further cases start. Stopping a
/// terminal run changes nothing.
pub async fn stop_run(state: &WorkbenchState, run_id: &str) -> Result<Run, WorkbenchError> {
    let mut run = state
        .store
        .get_run(run_id)?
        .ok_or_else(|| WorkbenchError::NotFound(format!("Run '{}'", run_id)))?;
    if run.status.is_terminal() {
        return Ok(run);
    }

    state.cancellations.abort(run_id);

    let now = Utc::now().to_rfc3339();
    run.status = RunStatus::Failed;
    run.error = Some(ABORTED_MESSAGE.to_string());
    run.completed_at = Some(now.clone());
    if !state.store.finish_run(&run)? {
        // Finished or deleted since the read.
        return state
            .store
            .get_run(run_id)?
            .ok_or_else(|| WorkbenchError::NotFound(format!("Run '{}'", run_id)));
    }

    if let Some(mut evaluation) = state.store.get_evaluation(&run.evaluation_id)? {
        evaluation.status = RunStatus::Failed;
        evaluation.updated_at = now;
        state.store.update_evaluation(&evaluation)?;
    }

    state.cancellations.release(run_id);
    state.sessions.invalidate(&run.evaluation_id).await;

    state
        .logs
        .emit(
            LogSource::Orchestrator,
            LogLevel::Warn,
            format!("Run {} stopped by user", run_id),
        )
        .await;
    Ok(run)
}

/// Delete a run and its results. A live run is signalled to stop first.
pub async fn delete_run(state: &WorkbenchState, run_id: &str) -> Result<(), WorkbenchError> {
    let run = state
        .store
        .get_run(run_id)?
        .ok_or_else(|| WorkbenchError::NotFound(format!("Run '{}'", run_id)))?;

    state.cancellations.abort(run_id);
    state.cancellations.release(run_id);
    state.store.delete_run(run_id)?;
    state.sessions.invalidate(&run.evaluation_id).await;

    info!("Deleted run {}", run_id);
    Ok(())
}

// ============================================================================
// Per-case execution
// ============================================================================

struct CaseContext<'a> {
    state: &'a WorkbenchState,
    evaluation: &'a Evaluation,
    criteria: &'a [EvaluationCriterion],
    target_sampling: &'a SamplingParams,
    judge_sampling: &'a SamplingParams,
    threshold: f64,
}

struct CaseOutcome {
    output: String,
    scores: CriterionScores,
    feedback: CriterionFeedback,
    latency_ms: u64,
    input_tokens: u64,
    output_tokens: u64,
}

/// Produce the result for one case. Failures become a failed result.
async fn execute_case(ctx: &CaseContext<'_>, run_id: &str, test_case: &TestCase) -> TestCaseResult {
    let message_text = render_prompt(
        ctx.evaluation.effective_template(),
        &test_case.variables,
        &test_case.input,
    );

    let mut result = TestCaseResult {
        id: uuid::Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        test_case_id: test_case.id.clone(),
        input: message_text.clone(),
        output: String::new(),
        scores: CriterionScores::new(),
        feedback: CriterionFeedback::new(),
        score: 0.0,
        latency_ms: 0,
        input_tokens: 0,
        output_tokens: 0,
        passed: false,
        error: None,
        created_at: String::new(),
    };

    match run_case(ctx, test_case, &message_text).await {
        Ok(outcome) => {
            let unscored = outcome
                .feedback
                .values()
                .filter(|f| f.as_str() == JUDGE_FAILURE_FEEDBACK)
                .count();
            if unscored > 0 {
                ctx.state
                    .logs
                    .emit(
                        LogSource::Judge,
                        LogLevel::Warn,
                        format!(
                            "Run {}: {} of {} criteria unscored for test case '{}'",
                            run_id,
                            unscored,
                            outcome.scores.len(),
                            test_case.name
                        ),
                    )
                    .await;
            }

            let score = weighted_score(&outcome.scores, ctx.criteria);
            result.output = outcome.output;
            result.scores = outcome.scores;
            result.feedback = outcome.feedback;
            result.score = score;
            result.latency_ms = outcome.latency_ms;
            result.input_tokens = outcome.input_tokens;
            result.output_tokens = outcome.output_tokens;
            result.passed = is_passed(score, ctx.threshold);
        }
        Err(e) => {
            warn!("Test case {} failed in run {}: {}", test_case.id, run_id, e);
            result.error = Some(e.to_string());
        }
    }

    result.created_at = Utc::now().to_rfc3339();
    result
}

async fn run_case(
    ctx: &CaseContext<'_>,
    test_case: &TestCase,
    message_text: &str,
) -> Result<CaseOutcome, ProviderError> {
    let state = ctx.state;
    let config = &ctx.evaluation.config;
    let model = ctx.evaluation.model.as_deref().unwrap_or_default();

    let message = build_user_message(
        state.attachments.as_ref(),
        message_text,
        &test_case.attachments,
        config.file_processing,
        config.ocr_provider.as_deref(),
    )
    .await?;

    let completion = state
        .models
        .complete(model, &[message], ctx.target_sampling)
        .await?;

    let (scores, feedback) = match ctx.evaluation.judge_model.as_deref() {
        Some(judge_model) if ctx.criteria.iter().any(|c| c.enabled) => {
            let judge = Judge {
                models: state.models.as_ref(),
                parser: state.score_parser.as_ref(),
                model: judge_model,
                sampling: ctx.judge_sampling,
            };
            judge
                .score_all(ctx.criteria, test_case, &completion.content)
                .await
        }
        _ => (CriterionScores::new(), CriterionFeedback::new()),
    };

    Ok(CaseOutcome {
        output: completion.content,
        scores,
        feedback,
        latency_ms: completion.latency_ms,
        input_tokens: completion.usage.prompt_tokens,
        output_tokens: completion.usage.completion_tokens,
    })
}

// ============================================================================
// Finalization
// ============================================================================

/// Record the run summary and terminal status, mirror it onto the
/// evaluation, then drop the cached detail.
///
/// A run already stopped keeps its status, error and completion time.
async fn finalize_run(
    state: &WorkbenchState,
    run: Run,
    evaluation_id: &str,
    token: &CancelToken,
    results: &[TestCaseResult],
) -> Run {
    let summary = summarize_run(results);
    let now = Utc::now().to_rfc3339();

    let mut final_run = run;
    final_run.results = Some(summary.clone());
    final_run.input_tokens = results.iter().map(|r| r.input_tokens).sum();
    final_run.output_tokens = results.iter().map(|r| r.output_tokens).sum();
    if token.is_aborted() {
        final_run.status = RunStatus::Failed;
        final_run.error = Some(ABORTED_MESSAGE.to_string());
    } else {
        final_run.status = RunStatus::Completed;
    }
    final_run.completed_at = Some(now.clone());

    let (final_run, deleted) = match state.store.finish_run(&final_run) {
        Ok(true) => (final_run, false),
        Ok(false) => {
            // Stopped first: keep its status, error and completion time.
            if let Err(e) = state.store.attach_run_summary(&final_run) {
                error!("Failed to record summary of run {}: {}", final_run.id, e);
            }
            match state.store.get_run(&final_run.id) {
                Ok(Some(stored)) => (stored, false),
                Ok(None) => (final_run, true),
                Err(e) => {
                    warn!("Failed to reload run {} after finalizing: {}", final_run.id, e);
                    (final_run, false)
                }
            }
        }
        Err(e) => {
            error!("Failed to finalize run {}: {}", final_run.id, e);
            (final_run, false)
        }
    };

    if !deleted {
        match state.store.get_evaluation(evaluation_id) {
            Ok(Some(mut evaluation)) => {
                evaluation.status = final_run.status;
                evaluation.results = Some(summary.clone());
                evaluation.updated_at = now;
                if let Err(e) = state.store.update_evaluation(&evaluation) {
                    error!("Failed to update evaluation {}: {}", evaluation_id, e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Failed to reload evaluation {}: {}", evaluation_id, e),
        }
    }

    state.cancellations.release(&final_run.id);
    state.live_runs.write().await.progress.remove(&final_run.id);
    state.sessions.invalidate(evaluation_id).await;

    let level = match final_run.status {
        RunStatus::Completed => LogLevel::Info,
        _ => LogLevel::Warn,
    };
    state
        .logs
        .emit(
            LogSource::Orchestrator,
            level,
            format!(
                "Run {} {}: {}",
                final_run.id,
                final_run.status.as_str(),
                summary.summary
            ),
        )
        .await;

    final_run
}

/// Fail a run whose task panicked so it never stays `running`.
async fn fail_crashed_run(state: &WorkbenchState, run_id: &str, evaluation_id: &str, reason: &str) {
    let now = Utc::now().to_rfc3339();
    match state.store.get_run(run_id) {
        Ok(Some(mut run)) if !run.status.is_terminal() => {
            run.status = RunStatus::Failed;
            run.error = Some(format!("Run crashed: {}", reason));
            run.completed_at = Some(now.clone());
            match state.store.finish_run(&run) {
                Ok(true) => {
                    if let Ok(Some(mut evaluation)) = state.store.get_evaluation(evaluation_id) {
                        evaluation.status = RunStatus::Failed;
                        evaluation.updated_at = now;
                        let _ = state.store.update_evaluation(&evaluation);
                    }
                }
                Ok(false) => {}
                Err(e) => error!("Failed to mark crashed run {} failed: {}", run_id, e),
            }
        }
        Ok(_) => {}
        Err(e) => error!("Failed to reload crashed run {}: {}", run_id, e),
    }

    state.cancellations.release(run_id);
    state.live_runs.write().await.progress.remove(run_id);
    state.sessions.invalidate(evaluation_id).await;

    state
        .logs
        .emit(
            LogSource::Orchestrator,
            LogLevel::Error,
            format!("Run {} crashed: {}", run_id, reason),
        )
        .await;
}
