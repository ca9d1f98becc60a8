//! Worker pool: membership map plus an idle set ordered by age.
//!
//! Pull order is deterministic: oldest `created_at` first, ties broken by
//! id. Pulled workers stay visible through `get_by_id`/`all`; only the idle
//! set shrinks.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::domain::ids::WorkerId;
use crate::error::Error;
use crate::worker::WorkerRecord;

struct PoolState {
    records: HashMap<WorkerId, Arc<WorkerRecord>>,
    idle: BTreeSet<(Instant, WorkerId)>,
}

pub struct WorkerPool {
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                records: HashMap::new(),
                idle: BTreeSet::new(),
            }),
        }
    }

    /// Insert a worker if not already present and mark it idle.
    /// Returns false when the id is already known.
    pub fn push(&self, record: Arc<WorkerRecord>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.records.contains_key(record.id()) {
            return false;
        }
        let key = (record.created_at(), record.id().clone());
        state.records.insert(record.id().clone(), Arc::clone(&record));
        state.idle.insert(key);
        true
    }

    /// Remove and return one idle worker, oldest first.
    pub fn pull(&self) -> Option<Arc<WorkerRecord>> {
        let mut state = self.state.lock().unwrap();
        while let Some((_, id)) = state.idle.pop_first() {
            if let Some(record) = state.records.get(&id) {
                return Some(Arc::clone(record));
            }
        }
        None
    }

    /// Return a previously pulled worker to the idle set.
    ///
    /// Errors when the worker is no longer a member (removed while it was
    /// out); the caller surfaces that to the diagnostic sink.
    pub(crate) fn check_in(&self, record: &Arc<WorkerRecord>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.records.contains_key(record.id()) {
            return Err(Error::NotFound(format!("worker {}", record.id())));
        }
        state.idle.insert((record.created_at(), record.id().clone()));
        Ok(())
    }

    pub fn get_by_id(&self, id: &WorkerId) -> Option<Arc<WorkerRecord>> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn remove(&self, id: &WorkerId) -> Option<Arc<WorkerRecord>> {
        let mut state = self.state.lock().unwrap();
        let record = state.records.remove(id)?;
        state.idle.remove(&(record.created_at(), record.id().clone()));
        Some(record)
    }

    /// All member workers, ordered oldest first.
    pub fn all(&self) -> Vec<Arc<WorkerRecord>> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by_key(|record| (record.created_at(), record.id().clone()));
        records
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_len(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
