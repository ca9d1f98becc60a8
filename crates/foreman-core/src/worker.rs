//! Worker contract and the dispatcher-side record that manages one slot.
//!
//! The contract is one-way: a worker exposes `run_task` and nothing else
//! about the dispatcher's internals. Carriers, result channels and status
//! transitions all live on the dispatcher side, in [`WorkerRecord`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::ids::WorkerId;
use crate::domain::metadata::{wall_value, Metadata};
use crate::domain::status::WorkerStatus;
use crate::domain::task::{Task, TaskContext};
use crate::error::TaskError;
use crate::ports::Clock;

/// One slot of execution capacity, implementable by embedders.
///
/// `run_task` executes the task function and reports its outcome; it must
/// observe `ctx.cancellation()` at safe points. Deadlines, panic recovery
/// and result delivery are handled by the dispatcher around this call.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &WorkerId;

    async fn run_task(&self, ctx: TaskContext, task: Arc<Task>) -> Result<Value, TaskError>;
}

/// Built-in worker: invokes the task's own function.
pub struct SimpleWorker {
    id: WorkerId,
}

impl SimpleWorker {
    pub fn new(id: WorkerId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Worker for SimpleWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn run_task(&self, ctx: TaskContext, task: Arc<Task>) -> Result<Value, TaskError> {
        task.call(ctx).await
    }
}

/// Dispatcher-owned record for one worker.
///
/// Holds the slot's status machine, the task currently occupying the slot
/// and the cancel handle of the in-flight attempt. At most one task per
/// worker at a time; a `Wait` worker has no current task.
pub struct WorkerRecord {
    worker: Arc<dyn Worker>,
    created_at: Instant,
    status: Mutex<WorkerStatus>,
    current_task: Mutex<Option<Arc<Task>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl WorkerRecord {
    pub(crate) fn new(worker: Arc<dyn Worker>, created_at: Instant) -> Arc<Self> {
        Arc::new(Self {
            worker,
            created_at,
            status: Mutex::new(WorkerStatus::Wait),
            current_task: Mutex::new(None),
            cancel: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &WorkerId {
        self.worker.id()
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock().unwrap()
    }

    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.current_task.lock().unwrap().clone()
    }

    /// Status write, dispatcher-only. Returns the previous status so the
    /// caller can fire the matching event.
    pub(crate) fn set_status(&self, status: WorkerStatus) -> WorkerStatus {
        std::mem::replace(&mut *self.status.lock().unwrap(), status)
    }

    pub(crate) fn set_current_task(&self, task: Option<Arc<Task>>) {
        *self.current_task.lock().unwrap() = task;
    }

    pub(crate) fn set_cancel(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap() = Some(token);
    }

    pub(crate) fn clear_cancel(&self) {
        *self.cancel.lock().unwrap() = None;
    }

    /// Fire the in-flight attempt's token, if any.
    pub(crate) fn cancel_current(&self) {
        if let Some(token) = self.cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    pub fn metadata(&self, clock: &dyn Clock) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("id".into(), Value::String(self.id().to_string()));
        meta.insert(
            "status".into(),
            Value::String(self.status().as_str().into()),
        );
        meta.insert(
            "created_at".into(),
            wall_value(clock, Some(self.created_at)),
        );
        if let Some(task) = self.current_task() {
            meta.insert("task_id".into(), Value::String(task.id().to_string()));
        }
        meta
    }
}
