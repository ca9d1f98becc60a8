//! Task queue: membership map with FIFO-with-delay pull semantics.
//!
//! Ready tasks queue in arrival order; tasks whose `allow_start_at` lies in
//! the future park in a min-heap and are promoted once due. `pull` returns
//! `None` when nothing is eligible even if the queue is non-empty. Pulled
//! tasks stay members (visible to `get_by_id`/`all`) until removed.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::domain::ids::TaskId;
use crate::domain::task::Task;
use crate::error::Error;

/// Delayed entry for the promotion heap.
///
/// Reverse ordering so the `BinaryHeap` acts as a min-heap (earliest due
/// first, ties by id).
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    due: Instant,
    id: TaskId,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct QueueState {
    records: HashMap<TaskId, Arc<Task>>,

    /// Eligible ids in arrival order.
    ready: VecDeque<TaskId>,

    /// Ids parked until `allow_start_at`.
    delayed: BinaryHeap<DelayedEntry>,

    /// Ids currently sitting in `ready` or `delayed`. Removal leaves stale
    /// ids behind in those structures; this set is what decides validity.
    enqueued: HashSet<TaskId>,
}

impl QueueState {
    fn enqueue(&mut self, task: &Arc<Task>, now: Instant) {
        let id = task.id().clone();
        self.enqueued.insert(id.clone());
        match task.allow_start_at() {
            Some(due) if due > now => self.delayed.push(DelayedEntry { due, id }),
            _ => self.ready.push_back(id),
        }
    }

    /// Move due delayed entries into the ready queue.
    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.due > now {
                break; // heap is sorted, nothing further is due
            }
            let entry = self.delayed.pop().unwrap();
            if !self.enqueued.contains(&entry.id) {
                continue;
            }
            let Some(task) = self.records.get(&entry.id) else {
                self.enqueued.remove(&entry.id);
                continue;
            };
            match task.allow_start_at() {
                // the policy moved while parked; park again under the new due
                Some(due) if due > now => self.delayed.push(DelayedEntry {
                    due,
                    id: entry.id,
                }),
                _ => self.ready.push_back(entry.id),
            }
        }
    }
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: HashMap::new(),
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                enqueued: HashSet::new(),
            }),
        }
    }

    /// Insert a task. Idempotent on id: a known id is left untouched and
    /// reported as false.
    pub fn push(&self, task: Arc<Task>, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.records.contains_key(task.id()) {
            return false;
        }
        state.records.insert(task.id().clone(), Arc::clone(&task));
        state.enqueue(&task, now);
        true
    }

    /// Return one eligible task, oldest enqueued first, or `None`.
    pub fn pull(&self, now: Instant) -> Option<Arc<Task>> {
        let mut state = self.state.lock().unwrap();
        state.promote(now);
        while let Some(id) = state.ready.pop_front() {
            if !state.enqueued.remove(&id) {
                continue;
            }
            if let Some(task) = state.records.get(&id) {
                return Some(Arc::clone(task));
            }
        }
        None
    }

    /// Re-enqueue a member task for its next attempt.
    pub(crate) fn requeue(&self, task: &Arc<Task>, now: Instant) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.records.contains_key(task.id()) {
            return Err(Error::NotFound(format!("task {}", task.id())));
        }
        if state.enqueued.contains(task.id()) {
            return Ok(());
        }
        state.enqueue(task, now);
        Ok(())
    }

    /// Hand an unmatched pulled task back to the front of the queue.
    pub(crate) fn restore(&self, task: &Arc<Task>) {
        let mut state = self.state.lock().unwrap();
        if !state.records.contains_key(task.id()) {
            return;
        }
        if state.enqueued.insert(task.id().clone()) {
            state.ready.push_front(task.id().clone());
        }
    }

    pub fn get_by_id(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn remove(&self, id: &TaskId) -> Option<Arc<Task>> {
        let mut state = self.state.lock().unwrap();
        state.enqueued.remove(id);
        state.records.remove(id)
    }

    /// All member tasks, including those currently executing.
    pub fn all(&self) -> Vec<Arc<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<_> = state.records.values().cloned().collect();
        tasks.sort_by_key(|task| (task.created_at(), task.id().clone()));
        tasks
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest instant at which a parked task becomes eligible.
    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .unwrap()
            .delayed
            .peek()
            .map(|entry| entry.due)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
