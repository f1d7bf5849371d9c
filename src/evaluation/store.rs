use super::{Evaluation, EvaluationCriterion, Run, SamplingParams, TestCase, TestCaseResult};

/// Persistence surface the run engine and session cache call into.
///
/// Updates and deletes report whether a row was touched. Lists of test
/// cases come back in `order_index` order, runs most recent first, and
/// results in append order.
pub trait EvaluationStore: Send + Sync {
    // Evaluations
    fn list_evaluations(&self) -> anyhow::Result<Vec<Evaluation>>;
    fn get_evaluation(&self, id: &str) -> anyhow::Result<Option<Evaluation>>;
    fn create_evaluation(&self, evaluation: &Evaluation) -> anyhow::Result<()>;
    fn update_evaluation(&self, evaluation: &Evaluation) -> anyhow::Result<bool>;
    fn delete_evaluation(&self, id: &str) -> anyhow::Result<bool>;

    // Test cases
    fn list_test_cases(&self, evaluation_id: &str) -> anyhow::Result<Vec<TestCase>>;
    fn get_test_case(&self, id: &str) -> anyhow::Result<Option<TestCase>>;
    fn create_test_case(&self, test_case: &TestCase) -> anyhow::Result<()>;
    fn update_test_case(&self, test_case: &TestCase) -> anyhow::Result<bool>;
    fn delete_test_case(&self, id: &str) -> anyhow::Result<bool>;

    // Criteria
    fn list_criteria(&self, evaluation_id: &str) -> anyhow::Result<Vec<EvaluationCriterion>>;
    fn create_criterion(&self, criterion: &EvaluationCriterion) -> anyhow::Result<()>;
    fn update_criterion(&self, criterion: &EvaluationCriterion) -> anyhow::Result<bool>;
    fn delete_criterion(&self, id: &str) -> anyhow::Result<bool>;

    // Runs
    fn list_runs(&self, evaluation_id: &str) -> anyhow::Result<Vec<Run>>;
    fn get_run(&self, id: &str) -> anyhow::Result<Option<Run>>;
    /// Create a run in `pending` state.
    fn create_run(
        &self,
        evaluation_id: &str,
        sampling: Option<&SamplingParams>,
    ) -> anyhow::Result<Run>;
    fn update_run(&self, run: &Run) -> anyhow::Result<bool>;
    /// Write a terminal state only while the run is still pending or running.
    fn finish_run(&self, run: &Run) -> anyhow::Result<bool>;
    /// Fill in the summary and token totals of a run that has no summary yet.
    fn attach_run_summary(&self, run: &Run) -> anyhow::Result<bool>;
    fn delete_run(&self, id: &str) -> anyhow::Result<bool>;

    // Results
    fn append_result(&self, run_id: &str, result: &TestCaseResult)
        -> anyhow::Result<TestCaseResult>;
    fn list_results(&self, run_id: &str) -> anyhow::Result<Vec<TestCaseResult>>;
}
