use std::collections::BTreeMap;

use super::{CriterionScores, EvaluationCriterion, RunResults, TestCaseResult};
use crate::config::DEFAULT_PASS_THRESHOLD;

/// Weighted average of `scores` over the enabled criteria that have a score.
///
/// With nothing to weigh (no judge, no enabled criteria, or all weights
/// zero) the case counts as a perfect `1.0`.
pub fn weighted_score(scores: &CriterionScores, criteria: &[EvaluationCriterion]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for criterion in criteria.iter().filter(|c| c.enabled) {
        if let Some(score) = scores.get(&criterion.name) {
            let weight = criterion.weight.max(0.0);
            weighted_sum += score * weight;
            total_weight += weight;
        }
    }

    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        1.0
    }
}

pub fn pass_threshold(configured: Option<f64>) -> f64 {
    configured.unwrap_or(DEFAULT_PASS_THRESHOLD)
}

pub fn is_passed(score: f64, threshold: f64) -> bool {
    score >= threshold
}

/// Aggregate per-case results into the run-level summary.
///
/// Each criterion's run score is the mean over the cases where it was
/// evaluated; judge failures were already recorded as `0` and count.
pub fn summarize_run(results: &[TestCaseResult]) -> RunResults {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for result in results {
        for (name, score) in &result.scores {
            let entry = sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }

    let criterion_scores = sums
        .into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect();

    let total_cases = results.len();
    let passed_cases = results.iter().filter(|r| r.passed).count();
    let pass_rate = if total_cases == 0 {
        0
    } else {
        (passed_cases as f64 * 100.0 / total_cases as f64).round() as u32
    };

    RunResults {
        criterion_scores,
        total_cases,
        passed_cases,
        pass_rate,
        summary: format!(
            "{}/{} test cases passed ({}%)",
            passed_cases, total_cases, pass_rate
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criterion(name: &str, weight: f64, enabled: bool) -> EvaluationCriterion {
        EvaluationCriterion {
            id: format!("crit-{}", name),
            evaluation_id: "eval-1".to_string(),
            name: name.to_string(),
            description: String::new(),
            prompt: String::new(),
            weight,
            enabled,
        }
    }

    fn scores(pairs: &[(&str, f64)]) -> CriterionScores {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn result(scores: CriterionScores, passed: bool) -> TestCaseResult {
        TestCaseResult {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: "run-1".to_string(),
            test_case_id: "case".to_string(),
            input: String::new(),
            output: String::new(),
            scores,
            feedback: Default::default(),
            score: 0.0,
            latency_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            passed,
            error: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_weighted_average() {
        let criteria = vec![criterion("accuracy", 3.0, true), criterion("tone", 1.0, true)];
        let score = weighted_score(&scores(&[("accuracy", 0.8), ("tone", 0.4)]), &criteria);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_and_unscored_criteria_ignored() {
        let criteria = vec![
            criterion("accuracy", 1.0, true),
            criterion("tone", 5.0, false),
            criterion("length", 5.0, true),
        ];
        let score = weighted_score(&scores(&[("accuracy", 0.5), ("tone", 0.0)]), &criteria);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_scored_counts_as_pass() {
        assert_eq!(weighted_score(&CriterionScores::new(), &[]), 1.0);
        let zero_weight = vec![criterion("accuracy", 0.0, true)];
        assert_eq!(weighted_score(&scores(&[("accuracy", 0.1)]), &zero_weight), 1.0);
    }

    #[test]
    fn test_threshold_default_and_boundary() {
        assert_eq!(pass_threshold(None), 0.6);
        assert_eq!(pass_threshold(Some(0.9)), 0.9);
        assert!(is_passed(0.6, 0.6));
        assert!(!is_passed(0.59, 0.6));
    }

    #[test]
    fn test_summarize_run_means_and_pass_rate() {
        let results = vec![
            result(scores(&[("accuracy", 1.0), ("tone", 0.5)]), true),
            result(scores(&[("accuracy", 0.0)]), false),
            result(CriterionScores::new(), true),
        ];
        let summary = summarize_run(&results);
        assert_eq!(summary.total_cases, 3);
        assert_eq!(summary.passed_cases, 2);
        assert_eq!(summary.pass_rate, 67);
        assert!((summary.criterion_scores["accuracy"] - 0.5).abs() < 1e-9);
        assert!((summary.criterion_scores["tone"] - 0.5).abs() < 1e-9);
        assert_eq!(summary.summary, "2/3 test cases passed (67%)");
    }

    #[test]
    fn test_summarize_empty_run() {
        let summary = summarize_run(&[]);
        assert_eq!(summary.total_cases, 0);
        assert_eq!(summary.pass_rate, 0);
        assert!(summary.criterion_scores.is_empty());
    }
}
