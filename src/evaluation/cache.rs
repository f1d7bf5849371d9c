use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;

use super::store::EvaluationStore;
use super::{Evaluation, EvaluationCriterion, Run, TestCase, TestCaseResult};
use crate::error::WorkbenchError;

/// Everything the detail view of one evaluation shows.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationDetail {
    pub evaluation: Evaluation,
    pub test_cases: Vec<TestCase>,
    pub criteria: Vec<EvaluationCriterion>,
    /// Most recent first.
    pub runs: Vec<Run>,
    /// Results of `selected_run_id`, in append order.
    pub results: Vec<TestCaseResult>,
    pub selected_run_id: Option<String>,
}

/// Read an evaluation's detail straight from the store, selecting its most
/// recent run.
pub fn load_detail(
    store: &dyn EvaluationStore,
    evaluation_id: &str,
) -> Result<EvaluationDetail, WorkbenchError> {
    let evaluation = store
        .get_evaluation(evaluation_id)?
        .ok_or_else(|| WorkbenchError::NotFound(format!("Evaluation '{}'", evaluation_id)))?;
    let test_cases = store.list_test_cases(evaluation_id)?;
    let criteria = store.list_criteria(evaluation_id)?;
    let runs = store.list_runs(evaluation_id)?;

    let selected_run_id = runs.first().map(|r| r.id.clone());
    let results = match &selected_run_id {
        Some(run_id) => store.list_results(run_id)?,
        None => Vec::new(),
    };

    Ok(EvaluationDetail {
        evaluation,
        test_cases,
        criteria,
        runs,
        results,
        selected_run_id,
    })
}

#[derive(Default)]
struct CacheSlot {
    detail: Option<Arc<EvaluationDetail>>,
    /// Fresh on every write and invalidation, so a writer that read an
    /// older slot cannot store over a newer one.
    generation: u64,
}

type LoadLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Per-evaluation load lock, dropped from the map by the last holder.
struct LoadLock<'a> {
    locks: &'a LoadLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> LoadLock<'a> {
    fn acquire(locks: &'a LoadLocks, key: &str) -> Self {
        let lock = locks
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .clone();
        Self {
            locks,
            key: key.to_string(),
            lock,
        }
    }
}

impl Drop for LoadLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap();
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Lazily populated detail per evaluation.
///
/// Concurrent first reads of the same evaluation share one load: callers
/// queue on a per-evaluation lock and the later ones find the entry filled.
#[derive(Default)]
pub struct EvaluationSessionCache {
    slots: RwLock<HashMap<String, CacheSlot>>,
    load_locks: LoadLocks,
    generations: AtomicU64,
    loads: AtomicUsize,
}

impl EvaluationSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn get(&self, evaluation_id: &str) -> Option<Arc<EvaluationDetail>> {
        self.snapshot(evaluation_id).await.map(|(detail, _)| detail)
    }

    async fn snapshot(&self, evaluation_id: &str) -> Option<(Arc<EvaluationDetail>, u64)> {
        let slots = self.slots.read().await;
        let slot = slots.get(evaluation_id)?;
        slot.detail.clone().map(|detail| (detail, slot.generation))
    }

    /// Store `detail` unless the slot changed since `generation` was read.
    /// A missing slot reads as generation `0`.
    async fn replace_if_current(
        &self,
        evaluation_id: &str,
        generation: u64,
        detail: Arc<EvaluationDetail>,
    ) -> bool {
        let mut slots = self.slots.write().await;
        let current = slots.get(evaluation_id).map_or(0, |slot| slot.generation);
        if current != generation {
            debug!("Discarding stale detail for evaluation {}", evaluation_id);
            return false;
        }
        slots.insert(
            evaluation_id.to_string(),
            CacheSlot {
                detail: Some(detail),
                generation: self.next_generation(),
            },
        );
        true
    }

    /// Return the cached detail, or run `loader` once to fill it.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        evaluation_id: &str,
        loader: F,
    ) -> Result<Arc<EvaluationDetail>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EvaluationDetail, E>>,
    {
        if let Some(detail) = self.get(evaluation_id).await {
            return Ok(detail);
        }

        let pending = LoadLock::acquire(&self.load_locks, evaluation_id);
        let _guard = pending.lock.lock().await;

        let generation = {
            let slots = self.slots.read().await;
            match slots.get(evaluation_id) {
                Some(CacheSlot {
                    detail: Some(detail),
                    ..
                }) => return Ok(detail.clone()),
                Some(slot) => slot.generation,
                None => 0,
            }
        };

        self.loads.fetch_add(1, Ordering::SeqCst);
        let detail = Arc::new(loader().await?);
        self.replace_if_current(evaluation_id, generation, detail.clone())
            .await;
        Ok(detail)
    }

    /// Drop the cached detail. The slot itself is kept only while a load
    /// is in flight, so that load sees it is stale.
    pub async fn invalidate(&self, evaluation_id: &str) {
        let mut slots = self.slots.write().await;
        let loading = self.load_locks.lock().unwrap().contains_key(evaluation_id);
        if loading {
            let slot = slots.entry(evaluation_id.to_string()).or_default();
            slot.detail = None;
            slot.generation = self.next_generation();
        } else {
            slots.remove(evaluation_id);
        }
    }

    /// Point the cached detail at another run of the same evaluation.
    ///
    /// Returns `None` when nothing is cached or the run is not listed.
    pub async fn select_run(
        &self,
        store: &dyn EvaluationStore,
        evaluation_id: &str,
        run_id: &str,
    ) -> Result<Option<Arc<EvaluationDetail>>, WorkbenchError> {
        let Some((current, generation)) = self.snapshot(evaluation_id).await else {
            return Ok(None);
        };
        if !current.runs.iter().any(|r| r.id == run_id) {
            return Ok(None);
        }

        let mut detail = (*current).clone();
        detail.results = store.list_results(run_id)?;
        detail.selected_run_id = Some(run_id.to_string());
        let detail = Arc::new(detail);

        self.replace_if_current(evaluation_id, generation, detail.clone())
            .await;
        Ok(Some(detail))
    }

    /// Number of loader invocations so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// Evaluations with unsaved draft edits. A dirty evaluation cannot start runs.
#[derive(Debug, Default)]
pub struct DraftRegistry {
    dirty: Mutex<HashSet<String>>,
}

impl DraftRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self, evaluation_id: &str) {
        self.dirty.lock().unwrap().insert(evaluation_id.to_string());
    }

    pub fn is_dirty(&self, evaluation_id: &str) -> bool {
        self.dirty.lock().unwrap().contains(evaluation_id)
    }

    pub fn clear(&self, evaluation_id: &str) {
        self.dirty.lock().unwrap().remove(evaluation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::db::SqliteEvaluationStore;
    use crate::evaluation::{EvaluationConfig, RunStatus};
    use std::time::Duration;

    fn seeded_store() -> SqliteEvaluationStore {
        let store = SqliteEvaluationStore::open_in_memory().unwrap();
        store
            .create_evaluation(&Evaluation {
                id: "e1".to_string(),
                name: "Translations".to_string(),
                model: Some("m".to_string()),
                judge_model: None,
                prompt: None,
                prompt_template: None,
                config: EvaluationConfig::default(),
                status: RunStatus::Pending,
                results: None,
                created_at: "2026-01-01T00:00:00Z".to_string(),
                updated_at: "2026-01-01T00:00:00Z".to_string(),
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_concurrent_first_reads_load_once() {
        let store = seeded_store();
        let cache = EvaluationSessionCache::new();

        let store = &store;
        let slow_load = move || async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            load_detail(store, "e1")
        };
        let (a, b) = tokio::join!(
            cache.get_or_load("e1", slow_load),
            cache.get_or_load("e1", slow_load)
        );

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(cache.load_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let store = seeded_store();
        let cache = EvaluationSessionCache::new();

        cache
            .get_or_load("e1", || async { load_detail(&store, "e1") })
            .await
            .unwrap();
        cache.invalidate("e1").await;
        assert!(cache.get("e1").await.is_none());

        cache
            .get_or_load("e1", || async { load_detail(&store, "e1") })
            .await
            .unwrap();
        assert_eq!(cache.load_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_load_is_not_overwritten() {
        let store = seeded_store();
        let cache = EvaluationSessionCache::new();

        let store = &store;
        let load = cache.get_or_load("e1", move || async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            load_detail(store, "e1")
        });
        let invalidate = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.invalidate("e1").await;
        };
        let (loaded, _) = tokio::join!(load, invalidate);

        assert!(loaded.is_ok());
        assert!(cache.get("e1").await.is_none());
    }

    #[tokio::test]
    async fn test_load_missing_evaluation_is_not_found() {
        let store = seeded_store();
        let cache = EvaluationSessionCache::new();
        let result = cache
            .get_or_load("nope", || async { load_detail(&store, "nope") })
            .await;
        assert!(matches!(result, Err(WorkbenchError::NotFound(_))));
        assert!(cache.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_select_run_swaps_results() {
        let store = seeded_store();
        let older = store.create_run("e1", None).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = store.create_run("e1", None).unwrap();

        let cache = EvaluationSessionCache::new();
        let detail = cache
            .get_or_load("e1", || async { load_detail(&store, "e1") })
            .await
            .unwrap();
        assert_eq!(detail.selected_run_id.as_deref(), Some(newer.id.as_str()));

        let detail = cache
            .select_run(&store, "e1", &older.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.selected_run_id.as_deref(), Some(older.id.as_str()));
        assert!(cache
            .select_run(&store, "e1", "unknown")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_loads_leave_no_entries_behind() {
        let store = seeded_store();
        let cache = EvaluationSessionCache::new();

        for id in ["gone-1", "gone-2", "gone-3"] {
            cache.invalidate(id).await;
        }
        assert!(cache.slots.read().await.is_empty());

        let store = &store;
        let load = move || async move { load_detail(store, "e1") };
        let (a, b) = tokio::join!(cache.get_or_load("e1", load), cache.get_or_load("e1", load));
        assert!(a.is_ok() && b.is_ok());
        assert!(cache.load_locks.lock().unwrap().is_empty());

        let _ = cache
            .get_or_load("nope", || async { load_detail(store, "nope") })
            .await;
        assert!(cache.load_locks.lock().unwrap().is_empty());

        cache.invalidate("e1").await;
        assert!(cache.slots.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_selection_from_before_reload_is_discarded() {
        let store = seeded_store();
        let run = store.create_run("e1", None).unwrap();
        let cache = EvaluationSessionCache::new();
        cache
            .get_or_load("e1", || async { load_detail(&store, "e1") })
            .await
            .unwrap();

        let (stale, generation) = cache.snapshot("e1").await.unwrap();
        cache.invalidate("e1").await;
        let reloaded = cache
            .get_or_load("e1", || async {
                let mut detail = load_detail(&store, "e1")?;
                detail.selected_run_id = None;
                Ok::<_, WorkbenchError>(detail)
            })
            .await
            .unwrap();

        let mut selected = (*stale).clone();
        selected.selected_run_id = Some(run.id.clone());
        assert!(
            !cache
                .replace_if_current("e1", generation, Arc::new(selected))
                .await
        );
        let cached = cache.get("e1").await.unwrap();
        assert!(Arc::ptr_eq(&cached, &reloaded));
        assert!(cached.selected_run_id.is_none());
    }

    #[test]
    fn test_draft_registry() {
        let drafts = DraftRegistry::new();
        assert!(!drafts.is_dirty("e1"));
        drafts.mark_dirty("e1");
        drafts.mark_dirty("e1");
        assert!(drafts.is_dirty("e1"));
        assert!(!drafts.is_dirty("e2"));
        drafts.clear("e1");
        assert!(!drafts.is_dirty("e1"));
    }
}
