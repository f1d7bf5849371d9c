use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Receiving side of a run's stop signal, held by the orchestrator.
///
/// Keeps the last value it saw even after the registry releases the run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }
}

/// One stop channel per live run.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `run_id` and hand back its token. Re-creating a live run
    /// replaces the old channel.
    pub fn create(&self, run_id: &str) -> CancelToken {
        let (tx, rx) = watch::channel(false);
        self.tokens.lock().unwrap().insert(run_id.to_string(), tx);
        CancelToken { rx }
    }

    /// Flip the run's flag. Returns false if the run has no live token.
    pub fn abort(&self, run_id: &str) -> bool {
        match self.tokens.lock().unwrap().get(run_id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_aborted(&self, run_id: &str) -> bool {
        self.tokens
            .lock()
            .unwrap()
            .get(run_id)
            .map(|tx| *tx.borrow())
            .unwrap_or(false)
    }

    pub fn release(&self, run_id: &str) {
        self.tokens.lock().unwrap().remove(run_id);
    }

    pub fn live_count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}
