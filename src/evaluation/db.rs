use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Mutex;

use super::store::EvaluationStore;
use super::{
    Evaluation, EvaluationCriterion, Run, RunStatus, SamplingParams, TestCase, TestCaseResult,
};
use crate::config::INTERRUPTED_MESSAGE;

pub struct SqliteEvaluationStore {
    conn: Mutex<Connection>,
}

const EVALUATION_COLUMNS: &str = "id, name, model, judge_model, prompt_json, prompt_template,
    config_json, status, results_json, created_at, updated_at";

const TEST_CASE_COLUMNS: &str = "id, evaluation_id, name, input, variables_json, attachments_json,
    expected_output, notes, order_index";

const CRITERION_COLUMNS: &str = "id, evaluation_id, name, description, prompt, weight, enabled";

const RUN_COLUMNS: &str = "id, evaluation_id, status, results_json, input_tokens, output_tokens,
    started_at, completed_at, error, sampling_json";

const RESULT_COLUMNS: &str = "id, run_id, test_case_id, input, output, scores_json, feedback_json,
    score, latency_ms, input_tokens, output_tokens, passed, error, created_at";

impl SqliteEvaluationStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        store.cleanup_stale_runs()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS evaluations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                model TEXT,
                judge_model TEXT,
                prompt_json TEXT,
                prompt_template TEXT,
                config_json TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                results_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                evaluation_id TEXT NOT NULL REFERENCES evaluations(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                input TEXT NOT NULL,
                variables_json TEXT NOT NULL DEFAULT '{}',
                attachments_json TEXT NOT NULL DEFAULT '[]',
                expected_output TEXT,
                notes TEXT,
                order_index INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS criteria (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                evaluation_id TEXT NOT NULL REFERENCES evaluations(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                prompt TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 1.0,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS runs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                evaluation_id TEXT NOT NULL REFERENCES evaluations(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                results_json TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                error TEXT,
                sampling_json TEXT
            );

            CREATE TABLE IF NOT EXISTS test_case_results (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                test_case_id TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                scores_json TEXT NOT NULL DEFAULT '{}',
                feedback_json TEXT NOT NULL DEFAULT '{}',
                score REAL NOT NULL,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                passed INTEGER NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tc_evaluation ON test_cases(evaluation_id, order_index);
            CREATE INDEX IF NOT EXISTS idx_crit_evaluation ON criteria(evaluation_id);
            CREATE INDEX IF NOT EXISTS idx_runs_evaluation ON runs(evaluation_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_tcr_run_id ON test_case_results(run_id);
        ",
        )?;
        Ok(())
    }

    /// Runs left live by a previous process can never finish; fail them.
    fn cleanup_stale_runs(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let stale = conn.execute(
            "UPDATE runs SET status = 'failed', error = ?1, completed_at = ?2
             WHERE status IN ('pending', 'running')",
            params![INTERRUPTED_MESSAGE, now],
        )?;
        conn.execute(
            "UPDATE evaluations SET status = 'failed' WHERE status = 'running'",
            [],
        )?;
        if stale > 0 {
            tracing::warn!("Marked {} interrupted runs as failed", stale);
        }
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn to_json<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn opt_json<T: serde::Serialize>(value: Option<&T>) -> anyhow::Result<Option<String>> {
    value.map(to_json).transpose()
}

/// Decode a JSON text column, treating NULL as the default value.
fn json_column<T: DeserializeOwned + Default>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => decode_json(idx, &raw),
        None => Ok(T::default()),
    }
}

fn opt_json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| decode_json(idx, &raw))
        .transpose()
}

fn decode_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        tracing::error!("Undecodable JSON in column {}: {}", idx, e);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn status_from(raw: String) -> RunStatus {
    RunStatus::parse(&raw).unwrap_or_default()
}

fn evaluation_from_row(row: &Row<'_>) -> rusqlite::Result<Evaluation> {
    Ok(Evaluation {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        judge_model: row.get(3)?,
        prompt: opt_json_column(row, 4)?,
        prompt_template: row.get(5)?,
        config: json_column(row, 6)?,
        status: status_from(row.get(7)?),
        results: opt_json_column(row, 8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn test_case_from_row(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    Ok(TestCase {
        id: row.get(0)?,
        evaluation_id: row.get(1)?,
        name: row.get(2)?,
        input: row.get(3)?,
        variables: json_column(row, 4)?,
        attachments: json_column(row, 5)?,
        expected_output: row.get(6)?,
        notes: row.get(7)?,
        order_index: row.get(8)?,
    })
}

fn criterion_from_row(row: &Row<'_>) -> rusqlite::Result<EvaluationCriterion> {
    Ok(EvaluationCriterion {
        id: row.get(0)?,
        evaluation_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        prompt: row.get(4)?,
        weight: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        evaluation_id: row.get(1)?,
        status: status_from(row.get(2)?),
        results: opt_json_column(row, 3)?,
        input_tokens: row.get::<_, i64>(4)? as u64,
        output_tokens: row.get::<_, i64>(5)? as u64,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        error: row.get(8)?,
        sampling: opt_json_column(row, 9)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<TestCaseResult> {
    Ok(TestCaseResult {
        id: row.get(0)?,
        run_id: row.get(1)?,
        test_case_id: row.get(2)?,
        input: row.get(3)?,
        output: row.get(4)?,
        scores: json_column(row, 5)?,
        feedback: json_column(row, 6)?,
        score: row.get(7)?,
        latency_ms: row.get::<_, i64>(8)? as u64,
        input_tokens: row.get::<_, i64>(9)? as u64,
        output_tokens: row.get::<_, i64>(10)? as u64,
        passed: row.get::<_, i64>(11)? != 0,
        error: row.get(12)?,
        created_at: row.get(13)?,
    })
}

impl EvaluationStore for SqliteEvaluationStore {
    // ========================================================================
    // Evaluation CRUD
    // ========================================================================

    fn list_evaluations(&self) -> anyhow::Result<Vec<Evaluation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluations ORDER BY created_at DESC",
            EVALUATION_COLUMNS
        ))?;
        let rows = stmt.query_map([], evaluation_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_evaluation(&self, id: &str) -> anyhow::Result<Option<Evaluation>> {
        let conn = self.conn();
        let evaluation = conn
            .query_row(
                &format!("SELECT {} FROM evaluations WHERE id=?1", EVALUATION_COLUMNS),
                params![id],
                evaluation_from_row,
            )
            .optional()?;
        Ok(evaluation)
    }

    fn create_evaluation(&self, evaluation: &Evaluation) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO evaluations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                EVALUATION_COLUMNS
            ),
            params![
                evaluation.id,
                evaluation.name,
                evaluation.model,
                evaluation.judge_model,
                opt_json(evaluation.prompt.as_ref())?,
                evaluation.prompt_template,
                to_json(&evaluation.config)?,
                evaluation.status.as_str(),
                opt_json(evaluation.results.as_ref())?,
                evaluation.created_at,
                evaluation.updated_at,
            ],
        )?;
        Ok(())
    }

    fn update_evaluation(&self, evaluation: &Evaluation) -> anyhow::Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE evaluations SET name=?2, model=?3, judge_model=?4, prompt_json=?5,
                prompt_template=?6, config_json=?7, status=?8, results_json=?9, updated_at=?10
             WHERE id=?1",
            params![
                evaluation.id,
                evaluation.name,
                evaluation.model,
                evaluation.judge_model,
                opt_json(evaluation.prompt.as_ref())?,
                evaluation.prompt_template,
                to_json(&evaluation.config)?,
                evaluation.status.as_str(),
                opt_json(evaluation.results.as_ref())?,
                evaluation.updated_at,
            ],
        )?;
        Ok(updated > 0)
    }

    fn delete_evaluation(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM evaluations WHERE id=?1", params![id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Test case CRUD
    // ========================================================================

    fn list_test_cases(&self, evaluation_id: &str) -> anyhow::Result<Vec<TestCase>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_cases WHERE evaluation_id=?1 ORDER BY order_index, rowid",
            TEST_CASE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![evaluation_id], test_case_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_test_case(&self, id: &str) -> anyhow::Result<Option<TestCase>> {
        let conn = self.conn();
        let test_case = conn
            .query_row(
                &format!("SELECT {} FROM test_cases WHERE id=?1", TEST_CASE_COLUMNS),
                params![id],
                test_case_from_row,
            )
            .optional()?;
        Ok(test_case)
    }

    fn create_test_case(&self, test_case: &TestCase) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO test_cases ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                TEST_CASE_COLUMNS
            ),
            params![
                test_case.id,
                test_case.evaluation_id,
                test_case.name,
                test_case.input,
                to_json(&test_case.variables)?,
                to_json(&test_case.attachments)?,
                test_case.expected_output,
                test_case.notes,
                test_case.order_index,
            ],
        )?;
        Ok(())
    }

    fn update_test_case(&self, test_case: &TestCase) -> anyhow::Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE test_cases SET name=?2, input=?3, variables_json=?4, attachments_json=?5,
                expected_output=?6, notes=?7, order_index=?8
             WHERE id=?1",
            params![
                test_case.id,
                test_case.name,
                test_case.input,
                to_json(&test_case.variables)?,
                to_json(&test_case.attachments)?,
                test_case.expected_output,
                test_case.notes,
                test_case.order_index,
            ],
        )?;
        Ok(updated > 0)
    }

    fn delete_test_case(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM test_cases WHERE id=?1", params![id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Criterion CRUD
    // ========================================================================

    fn list_criteria(&self, evaluation_id: &str) -> anyhow::Result<Vec<EvaluationCriterion>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM criteria WHERE evaluation_id=?1 ORDER BY seq",
            CRITERION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![evaluation_id], criterion_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn create_criterion(&self, criterion: &EvaluationCriterion) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO criteria ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                CRITERION_COLUMNS
            ),
            params![
                criterion.id,
                criterion.evaluation_id,
                criterion.name,
                criterion.description,
                criterion.prompt,
                criterion.weight,
                criterion.enabled as i64,
            ],
        )?;
        Ok(())
    }

    fn update_criterion(&self, criterion: &EvaluationCriterion) -> anyhow::Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE criteria SET name=?2, description=?3, prompt=?4, weight=?5, enabled=?6
             WHERE id=?1",
            params![
                criterion.id,
                criterion.name,
                criterion.description,
                criterion.prompt,
                criterion.weight,
                criterion.enabled as i64,
            ],
        )?;
        Ok(updated > 0)
    }

    fn delete_criterion(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM criteria WHERE id=?1", params![id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Run CRUD
    // ========================================================================

    fn list_runs(&self, evaluation_id: &str) -> anyhow::Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE evaluation_id=?1 ORDER BY started_at DESC, seq DESC",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![evaluation_id], run_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_run(&self, id: &str) -> anyhow::Result<Option<Run>> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id=?1", RUN_COLUMNS),
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn create_run(
        &self,
        evaluation_id: &str,
        sampling: Option<&SamplingParams>,
    ) -> anyhow::Result<Run> {
        let run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            evaluation_id: evaluation_id.to_string(),
            status: RunStatus::Pending,
            results: None,
            input_tokens: 0,
            output_tokens: 0,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            error: None,
            sampling: sampling.cloned(),
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (id, evaluation_id, status, started_at, sampling_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id,
                run.evaluation_id,
                run.status.as_str(),
                run.started_at,
                opt_json(run.sampling.as_ref())?,
            ],
        )?;
        Ok(run)
    }

    fn update_run(&self, run: &Run) -> anyhow::Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE runs SET status=?2, results_json=?3, input_tokens=?4, output_tokens=?5,
                completed_at=?6, error=?7
             WHERE id=?1",
            params![
                run.id,
                run.status.as_str(),
                opt_json(run.results.as_ref())?,
                run.input_tokens as i64,
                run.output_tokens as i64,
                run.completed_at,
                run.error,
            ],
        )?;
        Ok(updated > 0)
    }

    fn finish_run(&self, run: &Run) -> anyhow::Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE runs SET status=?2, results_json=?3, input_tokens=?4, output_tokens=?5,
                completed_at=?6, error=?7
             WHERE id=?1 AND status IN ('pending', 'running')",
            params![
                run.id,
                run.status.as_str(),
                opt_json(run.results.as_ref())?,
                run.input_tokens as i64,
                run.output_tokens as i64,
                run.completed_at,
                run.error,
            ],
        )?;
        Ok(updated > 0)
    }

    fn attach_run_summary(&self, run: &Run) -> anyhow::Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE runs SET results_json=?2, input_tokens=?3, output_tokens=?4
             WHERE id=?1 AND results_json IS NULL",
            params![
                run.id,
                opt_json(run.results.as_ref())?,
                run.input_tokens as i64,
                run.output_tokens as i64,
            ],
        )?;
        Ok(updated > 0)
    }

    fn delete_run(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM runs WHERE id=?1", params![id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Result append / query
    // ========================================================================

    fn append_result(
        &self,
        run_id: &str,
        result: &TestCaseResult,
    ) -> anyhow::Result<TestCaseResult> {
        let mut stored = result.clone();
        stored.run_id = run_id.to_string();
        if stored.id.is_empty() {
            stored.id = uuid::Uuid::new_v4().to_string();
        }

        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO test_case_results ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                RESULT_COLUMNS
            ),
            params![
                stored.id,
                stored.run_id,
                stored.test_case_id,
                stored.input,
                stored.output,
                to_json(&stored.scores)?,
                to_json(&stored.feedback)?,
                stored.score,
                stored.latency_ms as i64,
                stored.input_tokens as i64,
                stored.output_tokens as i64,
                stored.passed as i64,
                stored.error,
                stored.created_at,
            ],
        )?;
        Ok(stored)
    }

    fn list_results(&self, run_id: &str) -> anyhow::Result<Vec<TestCaseResult>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_case_results WHERE run_id=?1 ORDER BY seq",
            RESULT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], result_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{EvaluationConfig, RunResults};

    fn evaluation(id: &str) -> Evaluation {
        let now = Utc::now().to_rfc3339();
        Evaluation {
            id: id.to_string(),
            name: "Support replies".to_string(),
            model: Some("gpt-4o-mini".to_string()),
            judge_model: Some("gpt-4o".to_string()),
            prompt: None,
            prompt_template: Some("Answer politely: {{input}}".to_string()),
            config: EvaluationConfig {
                pass_threshold: Some(0.75),
                ..Default::default()
            },
            status: RunStatus::Pending,
            results: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn test_case(id: &str, evaluation_id: &str, order_index: i64) -> TestCase {
        TestCase {
            id: id.to_string(),
            evaluation_id: evaluation_id.to_string(),
            name: id.to_string(),
            input: format!("input for {}", id),
            variables: [("tone".to_string(), "warm".to_string())].into(),
            attachments: vec!["file-1".to_string()],
            expected_output: Some("ok".to_string()),
            notes: None,
            order_index,
        }
    }

    fn result(test_case_id: &str) -> TestCaseResult {
        TestCaseResult {
            id: String::new(),
            run_id: String::new(),
            test_case_id: test_case_id.to_string(),
            input: "in".to_string(),
            output: "out".to_string(),
            scores: [("accuracy".to_string(), 0.8)].into(),
            feedback: [("accuracy".to_string(), "good".to_string())].into(),
            score: 0.8,
            latency_ms: 120,
            input_tokens: 10,
            output_tokens: 5,
            passed: true,
            error: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_evaluation_roundtrip_keeps_config() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();

        let loaded = store.get_evaluation("e1").unwrap().unwrap();
        assert_eq!(loaded.config.pass_threshold, Some(0.75));
        assert_eq!(loaded.judge_model.as_deref(), Some("gpt-4o"));
        assert_eq!(loaded.status, RunStatus::Pending);
        assert!(store.get_evaluation("missing").unwrap().is_none());
    }

    #[test]
    fn test_test_cases_listed_in_order() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();
        store.create_test_case(&test_case("b", "e1", 2)).unwrap();
        store.create_test_case(&test_case("a", "e1", 1)).unwrap();

        let cases = store.list_test_cases("e1").unwrap();
        let ids: Vec<_> = cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(cases[0].variables["tone"], "warm");
        assert_eq!(cases[0].attachments, vec!["file-1".to_string()]);
    }

    #[test]
    fn test_results_keep_append_order_and_maps() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();
        let run = store.create_run("e1", None).unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        for id in ["c3", "c1", "c2"] {
            let stored = store.append_result(&run.id, &result(id)).unwrap();
            assert!(!stored.id.is_empty());
            assert_eq!(stored.run_id, run.id);
        }

        let results = store.list_results(&run.id).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.test_case_id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c1", "c2"]);
        assert_eq!(results[0].feedback["accuracy"], "good");
        assert!(results[0].passed);
    }

    #[test]
    fn test_update_run_persists_results() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();
        let mut run = store
            .create_run(
                "e1",
                Some(&SamplingParams {
                    temperature: Some(0.3),
                    ..Default::default()
                }),
            )
            .unwrap();

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now().to_rfc3339());
        run.results = Some(RunResults {
            total_cases: 2,
            passed_cases: 1,
            pass_rate: 50,
            ..Default::default()
        });
        assert!(store.update_run(&run).unwrap());

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.results.unwrap().pass_rate, 50);
        assert_eq!(loaded.sampling.unwrap().temperature, Some(0.3));
    }

    #[test]
    fn test_finish_run_leaves_terminal_run_alone() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();
        let mut run = store.create_run("e1", None).unwrap();

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now().to_rfc3339());
        run.input_tokens = 42;
        run.results = Some(RunResults {
            total_cases: 3,
            ..Default::default()
        });
        assert!(store.finish_run(&run).unwrap());

        let mut late_stop = run.clone();
        late_stop.status = RunStatus::Failed;
        late_stop.error = Some("stopped".to_string());
        late_stop.results = None;
        late_stop.input_tokens = 0;
        assert!(!store.finish_run(&late_stop).unwrap());
        assert!(!store.attach_run_summary(&late_stop).unwrap());

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.error.is_none());
        assert_eq!(loaded.input_tokens, 42);
        assert_eq!(loaded.results.unwrap().total_cases, 3);
    }

    #[test]
    fn test_attach_summary_fills_stopped_run_once() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();
        let mut run = store.create_run("e1", None).unwrap();
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now().to_rfc3339());
        assert!(store.finish_run(&run).unwrap());

        run.results = Some(RunResults {
            total_cases: 1,
            ..Default::default()
        });
        run.output_tokens = 7;
        assert!(store.attach_run_summary(&run).unwrap());
        assert!(!store.attach_run_summary(&run).unwrap());

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.output_tokens, 7);
        assert_eq!(loaded.results.unwrap().total_cases, 1);
    }

    #[test]
    fn test_corrupt_json_column_is_an_error() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();
        let run = store.create_run("e1", None).unwrap();
        store
            .conn()
            .execute(
                "UPDATE runs SET results_json=?2 WHERE id=?1",
                params![run.id, r#"{"criterion_scores":{"tone":null}}"#],
            )
            .unwrap();

        assert!(store.get_run(&run.id).is_err());
        assert!(store.list_runs("e1").is_err());
    }

    #[test]
    fn test_delete_evaluation_cascades() {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store.create_evaluation(&evaluation("e1")).unwrap();
        store.create_test_case(&test_case("a", "e1", 0)).unwrap();
        let run = store.create_run("e1", None).unwrap();
        store.append_result(&run.id, &result("a")).unwrap();

        assert!(store.delete_evaluation("e1").unwrap());
        assert!(store.list_test_cases("e1").unwrap().is_empty());
        assert!(store.get_run(&run.id).unwrap().is_none());
        assert!(store.list_results(&run.id).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_fails_interrupted_runs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workbench.db");
        let run_id = {
            let store = SqliteEvaluationStore::new(&path).unwrap();
            store.create_evaluation(&evaluation("e1")).unwrap();
            let mut run = store.create_run("e1", None).unwrap();
            run.status = RunStatus::Running;
            store.update_run(&run).unwrap();
            run.id
        };

        let store = SqliteEvaluationStore::new(&path).unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    }
}
