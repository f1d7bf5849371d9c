use std::collections::{BTreeMap, HashMap};

use super::scoring::summarize_run;
use super::store::EvaluationStore;
use super::{AggregateDelta, CaseComparison, CompareReport, Run, RunWithResults, TestCaseResult};
use crate::error::WorkbenchError;

/// Smallest score change that counts as a regression or improvement.
pub const CHANGE_THRESHOLD: f64 = 0.1;

// Absorbs float noise such as 0.9 - 0.8 < 0.1.
const EPSILON: f64 = 1e-9;

/// Runs of an evaluation, most recent first.
pub fn list_runs(
    store: &dyn EvaluationStore,
    evaluation_id: &str,
) -> Result<Vec<Run>, WorkbenchError> {
    Ok(store.list_runs(evaluation_id)?)
}

pub fn get_run_with_results(
    store: &dyn EvaluationStore,
    run_id: &str,
) -> Result<RunWithResults, WorkbenchError> {
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| WorkbenchError::NotFound(format!("Run '{}'", run_id)))?;
    let results = store.list_results(run_id)?;
    Ok(RunWithResults { run, results })
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn pass_rate(run: &Run, results: &[TestCaseResult]) -> u32 {
    run.results
        .as_ref()
        .map(|r| r.pass_rate)
        .unwrap_or_else(|| summarize_run(results).pass_rate)
}

/// Compare two runs case by case, matching results on test case id.
///
/// Cases present in only one run are listed without a delta.
pub fn compare_runs(
    store: &dyn EvaluationStore,
    current_id: &str,
    baseline_id: &str,
) -> Result<CompareReport, WorkbenchError> {
    let current = get_run_with_results(store, current_id)?;
    let baseline = get_run_with_results(store, baseline_id)?;

    let baseline_by_case: HashMap<&str, &TestCaseResult> = baseline
        .results
        .iter()
        .map(|r| (r.test_case_id.as_str(), r))
        .collect();

    let mut per_case = Vec::new();
    let mut regressions = 0usize;
    let mut improvements = 0usize;
    let mut unchanged = 0usize;

    for result in &current.results {
        let base = baseline_by_case.get(result.test_case_id.as_str()).copied();
        let delta = base.map(|b| result.score - b.score);

        let regression = delta.is_some_and(|d| d <= -(CHANGE_THRESHOLD - EPSILON));
        let improvement = delta.is_some_and(|d| d >= CHANGE_THRESHOLD - EPSILON);
        if regression {
            regressions += 1;
        } else if improvement {
            improvements += 1;
        } else if delta.is_some() {
            unchanged += 1;
        }

        let criterion_deltas: BTreeMap<String, f64> = match base {
            Some(b) => result
                .scores
                .iter()
                .filter_map(|(name, score)| b.scores.get(name).map(|bs| (name.clone(), score - bs)))
                .collect(),
            None => BTreeMap::new(),
        };

        per_case.push(CaseComparison {
            test_case_id: result.test_case_id.clone(),
            baseline_score: base.map(|b| b.score),
            current_score: Some(result.score),
            delta,
            regression,
            improvement,
            criterion_deltas,
        });
    }

    for result in &baseline.results {
        if !current
            .results
            .iter()
            .any(|r| r.test_case_id == result.test_case_id)
        {
            per_case.push(CaseComparison {
                test_case_id: result.test_case_id.clone(),
                baseline_score: Some(result.score),
                current_score: None,
                delta: None,
                regression: false,
                improvement: false,
                criterion_deltas: BTreeMap::new(),
            });
        }
    }

    let avg_score_delta = match (
        mean(current.results.iter().map(|r| r.score)),
        mean(baseline.results.iter().map(|r| r.score)),
    ) {
        (Some(c), Some(b)) => Some(c - b),
        _ => None,
    };
    let pass_rate_delta = pass_rate(&current.run, &current.results) as i64
        - pass_rate(&baseline.run, &baseline.results) as i64;

    Ok(CompareReport {
        current_run_id: current_id.to_string(),
        baseline_run_id: baseline_id.to_string(),
        per_case,
        aggregate: AggregateDelta {
            avg_score_delta,
            pass_rate_delta,
            regressions,
            improvements,
            unchanged,
        },
    })
}
