//! Task: an immutable function plus mutable execution metadata.
//!
//! The task itself is a data record; it never transitions its own status.
//! All transitions (and the events that go with them) are driven by the
//! dispatcher, which keeps the state machine in one place.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::ids::TaskId;
use crate::domain::metadata::{wall_value, Metadata};
use crate::domain::status::TaskStatus;
use crate::error::TaskError;
use crate::ports::Clock;

/// Boxed future returned by a task function.
pub type BoxTaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'static>>;

/// The unit-of-work callable.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> BoxTaskFuture + Send + Sync>;

/// Per-attempt context handed to the task function.
#[derive(Clone)]
pub struct TaskContext {
    attempt: u32,
    cancellation: CancellationToken,
    task: Arc<Task>,
}

impl TaskContext {
    pub(crate) fn new(attempt: u32, cancellation: CancellationToken, task: Arc<Task>) -> Self {
        Self {
            attempt,
            cancellation,
            task,
        }
    }

    /// Attempt number of this invocation, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cancellation token for this attempt.
    ///
    /// Functions must observe it at safe points and return promptly; the
    /// dispatcher never kills a non-cooperating function.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn args(&self) -> &[Value] {
        self.task.args()
    }

    /// The task being executed. Handy for adjusting `repeats` or
    /// `repeat_interval` for subsequent attempts from inside the function.
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
}

struct Policy {
    timeout: Duration,
    repeats: i64,
    repeat_interval: Duration,
    allow_start_at: Option<Instant>,
}

struct ExecState {
    status: TaskStatus,
    attempts: u32,
    created_at: Option<Instant>,
    first_started_at: Option<Instant>,
    last_started_at: Option<Instant>,
    finished_at: Option<Instant>,
    last_error: Option<TaskError>,
}

/// One invocation request.
///
/// Policy fields gate scheduling: `timeout` of zero means unbounded,
/// `repeats` is the total attempt budget (`-1` for unbounded retry),
/// `repeat_interval` is the minimum delay before the next attempt and
/// `allow_start_at` holds the task back until an absolute instant.
pub struct Task {
    id: TaskId,
    name: String,
    func: TaskFn,
    args: Vec<Value>,
    policy: Mutex<Policy>,
    exec: Mutex<ExecState>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Task {
    pub fn new<F, Fut>(id: TaskId, func: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self::from_fn(id, Arc::new(move |ctx| Box::pin(func(ctx)) as BoxTaskFuture))
    }

    pub fn from_fn(id: TaskId, func: TaskFn) -> Self {
        let name = id.to_string();
        Self {
            id,
            name,
            func,
            args: Vec::new(),
            policy: Mutex::new(Policy {
                timeout: Duration::ZERO,
                repeats: 1,
                repeat_interval: Duration::ZERO,
                allow_start_at: None,
            }),
            exec: Mutex::new(ExecState {
                status: TaskStatus::Wait,
                attempts: 0,
                created_at: None,
                first_started_at: None,
                last_started_at: None,
                finished_at: None,
                last_error: None,
            }),
            cancel: Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    pub fn with_repeats(self, repeats: i64) -> Self {
        self.set_repeats(repeats);
        self
    }

    pub fn with_repeat_interval(self, interval: Duration) -> Self {
        self.set_repeat_interval(interval);
        self
    }

    pub fn with_allow_start_at(self, at: Instant) -> Self {
        self.set_allow_start_at(Some(at));
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Invoke the task function. Used by workers; dispatch bookkeeping
    /// happens outside.
    pub fn call(&self, ctx: TaskContext) -> BoxTaskFuture {
        (self.func)(ctx)
    }

    pub fn timeout(&self) -> Duration {
        self.policy.lock().unwrap().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.policy.lock().unwrap().timeout = timeout;
    }

    pub fn repeats(&self) -> i64 {
        self.policy.lock().unwrap().repeats
    }

    pub fn set_repeats(&self, repeats: i64) {
        self.policy.lock().unwrap().repeats = repeats;
    }

    pub fn repeat_interval(&self) -> Duration {
        self.policy.lock().unwrap().repeat_interval
    }

    pub fn set_repeat_interval(&self, interval: Duration) {
        self.policy.lock().unwrap().repeat_interval = interval;
    }

    pub fn allow_start_at(&self) -> Option<Instant> {
        self.policy.lock().unwrap().allow_start_at
    }

    pub fn set_allow_start_at(&self, at: Option<Instant>) {
        self.policy.lock().unwrap().allow_start_at = at;
    }

    pub fn status(&self) -> TaskStatus {
        self.exec.lock().unwrap().status
    }

    pub fn attempts(&self) -> u32 {
        self.exec.lock().unwrap().attempts
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.exec.lock().unwrap().created_at
    }

    pub fn first_started_at(&self) -> Option<Instant> {
        self.exec.lock().unwrap().first_started_at
    }

    pub fn last_started_at(&self) -> Option<Instant> {
        self.exec.lock().unwrap().last_started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.exec.lock().unwrap().finished_at
    }

    pub fn last_error(&self) -> Option<TaskError> {
        self.exec.lock().unwrap().last_error.clone()
    }

    /// Status write, dispatcher-only. Returns the previous status so the
    /// caller can fire the matching event.
    pub(crate) fn set_status(&self, status: TaskStatus) -> TaskStatus {
        let mut exec = self.exec.lock().unwrap();
        std::mem::replace(&mut exec.status, status)
    }

    pub(crate) fn mark_added(&self, now: Instant) {
        let mut exec = self.exec.lock().unwrap();
        exec.created_at.get_or_insert(now);
    }

    /// Start of one attempt: bump the counter and stamp start times.
    /// `attempts == 0` iff `first_started_at` is unset.
    pub(crate) fn begin_attempt(&self, now: Instant) -> u32 {
        let mut exec = self.exec.lock().unwrap();
        exec.attempts += 1;
        if exec.attempts == 1 {
            exec.first_started_at = Some(now);
        }
        exec.last_started_at = Some(now);
        exec.finished_at = None;
        exec.last_error = None;
        exec.attempts
    }

    pub(crate) fn finish_attempt(&self, now: Instant, error: Option<TaskError>) {
        let mut exec = self.exec.lock().unwrap();
        exec.finished_at = Some(now);
        exec.last_error = error;
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
        let exec = self.exec.lock().unwrap();
        let mut meta = Metadata::new();
        meta.insert("id".into(), Value::String(self.id.to_string()));
        meta.insert("name".into(), Value::String(self.name.clone()));
        meta.insert("status".into(), Value::String(exec.status.as_str().into()));
        meta.insert("created_at".into(), wall_value(clock, exec.created_at));
        meta.insert("attempts".into(), Value::from(exec.attempts));
        meta.insert(
            "first_started_at".into(),
            wall_value(clock, exec.first_started_at),
        );
        meta.insert(
            "last_started_at".into(),
            wall_value(clock, exec.last_started_at),
        );
        meta.insert("finished_at".into(), wall_value(clock, exec.finished_at));
        meta.insert(
            "last_error".into(),
            exec.last_error
                .as_ref()
                .map(|err| Value::String(err.to_string()))
                .unwrap_or(Value::Null),
        );
        meta
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}
