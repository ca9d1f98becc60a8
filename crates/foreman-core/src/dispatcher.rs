//! Dispatcher: pairs ready tasks with idle workers and collects results.
//!
//! Three long-lived carriers cooperate while the dispatcher runs:
//! - the dispatch cycle, woken by a one-slot notify channel, the fallback
//!   tick, or the next parked task coming due;
//! - the result collector, which applies each completion to the task and
//!   worker state machines and decides on retries;
//! - the shutdown waiter inside [`Dispatcher::run`] itself.
//!
//! Each in-flight task occupies one additional short-lived carrier that owns
//! the attempt's child cancellation token and emits exactly one completion.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::domain::events::{Event, EventKind};
use crate::domain::ids::{ListenerId, TaskId, WorkerId};
use crate::domain::metadata::Metadata;
use crate::domain::status::{DispatcherStatus, TaskStatus, WorkerStatus};
use crate::domain::task::{Task, TaskContext};
use crate::error::{Error, TaskError};
use crate::listener::{Listener, ListenerBus};
use crate::observability::StatusCounts;
use crate::pool::WorkerPool;
use crate::ports::{Clock, IdSource, TokioClock, UlidIdSource};
use crate::queue::TaskQueue;
use crate::worker::{SimpleWorker, Worker, WorkerRecord};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Result envelope handed from a task carrier to the collector.
/// Produced exactly once per dispatch attempt.
struct Completion {
    record: Arc<WorkerRecord>,
    task: Arc<Task>,
    value: Option<Value>,
    error: Option<TaskError>,
    cancelled: bool,
}

/// Receiver halves, consumed by the first (and only) `run`.
struct Channels {
    notify_rx: mpsc::Receiver<()>,
    results_rx: mpsc::UnboundedReceiver<Completion>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    status: AtomicU8,
    pool: WorkerPool,
    queue: TaskQueue,
    bus: ListenerBus,
    root: CancellationToken,
    tracker: TaskTracker,
    tick: Mutex<Duration>,
    notify_tx: mpsc::Sender<()>,
    results_tx: mpsc::UnboundedSender<Completion>,
    channels: Mutex<Option<Channels>>,
}

pub struct DispatcherBuilder {
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdSource>>,
    tick_interval: Duration,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            clock: None,
            ids: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Interval of the fallback re-dispatch tick. Zero disables the tick.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn build(self) -> Dispatcher {
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidIdSource::new(Arc::clone(&clock))));

        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Dispatcher {
            shared: Arc::new(Shared {
                clock,
                ids,
                status: AtomicU8::new(DispatcherStatus::Wait.as_u8()),
                pool: WorkerPool::new(),
                queue: TaskQueue::new(),
                bus: ListenerBus::new(),
                root: CancellationToken::new(),
                tracker: TaskTracker::new(),
                tick: Mutex::new(self.tick_interval),
                notify_tx,
                results_tx,
                channels: Mutex::new(Some(Channels {
                    notify_rx,
                    results_rx,
                })),
            }),
        }
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The coordinator. Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn status(&self) -> DispatcherStatus {
        self.shared.status()
    }

    /// Enter the matching loop. Returns after `cancel()` once every
    /// in-flight carrier has drained.
    pub async fn run(&self) -> Result<(), Error> {
        let shared = &self.shared;
        if shared
            .status
            .compare_exchange(
                DispatcherStatus::Wait.as_u8(),
                DispatcherStatus::Process.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::PolicyViolation("dispatcher is running".into()));
        }

        let channels = shared.channels.lock().unwrap().take();
        let Some(Channels {
            notify_rx,
            results_rx,
        }) = channels
        else {
            shared
                .status
                .store(DispatcherStatus::Wait.as_u8(), Ordering::Release);
            return Err(Error::PolicyViolation(
                "dispatcher cannot be restarted".into(),
            ));
        };

        shared.bus.trigger(Event::DispatcherStatusChanged {
            current: DispatcherStatus::Process,
            previous: DispatcherStatus::Wait,
        });

        shared
            .tracker
            .spawn(result_collector(Arc::clone(shared), results_rx));
        shared
            .tracker
            .spawn(dispatch_cycle(Arc::clone(shared), notify_rx));
        shared.notify();

        shared.root.cancelled().await;

        shared.set_status(DispatcherStatus::Cancel);
        for record in shared.pool.all() {
            shared.set_worker_status(&record, WorkerStatus::Cancel);
        }
        for task in shared.queue.all() {
            shared.set_task_status(&task, TaskStatus::Cancel);
        }

        // 走行中の carrier が全部抜けるまで待つ
        shared.tracker.close();
        shared.tracker.wait().await;

        shared.set_status(DispatcherStatus::Wait);
        Ok(())
    }

    /// Request shutdown through the root context. Idempotent.
    pub fn cancel(&self) -> Result<(), Error> {
        self.shared.root.cancel();
        Ok(())
    }

    pub fn set_tick_interval(&self, interval: Duration) {
        *self.shared.tick.lock().unwrap() = interval;
        self.shared.notify();
    }

    pub fn add_worker(&self, worker: Arc<dyn Worker>) -> Result<(), Error> {
        let shared = &self.shared;
        let record = WorkerRecord::new(worker, shared.clock.now());
        if !shared.pool.push(Arc::clone(&record)) {
            return Err(Error::PolicyViolation(format!(
                "worker {} is already registered",
                record.id()
            )));
        }
        shared.bus.trigger(Event::WorkerAdd {
            worker: Arc::clone(record.worker()),
            metadata: record.metadata(shared.clock.as_ref()),
        });
        shared.notify();
        Ok(())
    }

    /// Register a built-in worker with a generated id.
    pub fn add_simple_worker(&self) -> Result<WorkerId, Error> {
        let id = self.shared.ids.worker_id();
        self.add_worker(Arc::new(SimpleWorker::new(id.clone())))?;
        Ok(id)
    }

    /// Remove a worker, cancelling its in-flight task first.
    pub fn remove_worker(&self, id: &WorkerId) -> Result<(), Error> {
        let shared = &self.shared;
        let record = shared
            .pool
            .get_by_id(id)
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;

        shared.set_worker_status(&record, WorkerStatus::Cancel);
        record.cancel_current();
        record.set_current_task(None);
        shared.pool.remove(id);

        shared.bus.trigger(Event::WorkerRemove {
            worker: Arc::clone(record.worker()),
            metadata: record.metadata(shared.clock.as_ref()),
        });
        Ok(())
    }

    pub fn get_workers(&self) -> Vec<Arc<dyn Worker>> {
        self.shared
            .pool
            .all()
            .into_iter()
            .map(|record| Arc::clone(record.worker()))
            .collect()
    }

    pub fn get_worker_metadata(&self, id: &WorkerId) -> Option<Metadata> {
        let shared = &self.shared;
        shared
            .pool
            .get_by_id(id)
            .map(|record| record.metadata(shared.clock.as_ref()))
    }

    /// Queue a task. Idempotent on id: re-adding a known task is a no-op.
    pub fn add_task(&self, task: Arc<Task>) {
        let shared = &self.shared;
        let now = shared.clock.now();
        task.mark_added(now);
        if !shared.queue.push(Arc::clone(&task), now) {
            return;
        }
        shared.bus.trigger(Event::TaskAdd {
            metadata: task.metadata(shared.clock.as_ref()),
            task,
        });
        shared.notify();
    }

    /// Build a task from a bare function, queue it and hand it back.
    pub fn add_task_fn<F, Fut>(&self, func: F, args: Vec<Value>) -> Arc<Task>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        let task = Arc::new(Task::new(self.shared.ids.task_id(), func).with_args(args));
        self.add_task(Arc::clone(&task));
        task
    }

    /// Like [`add_task_fn`](Self::add_task_fn) with an explicit name.
    pub fn add_named_task_fn<F, Fut>(&self, name: &str, func: F, args: Vec<Value>) -> Arc<Task>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        let task = Arc::new(
            Task::new(self.shared.ids.task_id(), func)
                .with_name(name)
                .with_args(args),
        );
        self.add_task(Arc::clone(&task));
        task
    }

    /// Remove a task, cancelling it if currently executing.
    pub fn remove_task(&self, id: &TaskId) -> Result<(), Error> {
        let shared = &self.shared;
        let task = shared
            .queue
            .get_by_id(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        shared.set_task_status(&task, TaskStatus::Cancel);
        task.cancel_current();
        shared.queue.remove(id);

        shared.bus.trigger(Event::TaskRemove {
            metadata: task.metadata(shared.clock.as_ref()),
            task,
        });
        Ok(())
    }

    pub fn get_tasks(&self) -> Vec<Arc<Task>> {
        self.shared.queue.all()
    }

    pub fn get_task_metadata(&self, id: &TaskId) -> Option<Metadata> {
        let shared = &self.shared;
        shared
            .queue
            .get_by_id(id)
            .map(|task| task.metadata(shared.clock.as_ref()))
    }

    pub fn add_listener(&self, kind: EventKind, listener: Arc<dyn Listener>) {
        let shared = &self.shared;
        let id = listener.id().clone();
        if !shared.bus.attach(kind, listener, shared.clock.now()) {
            return;
        }
        shared.bus.trigger(Event::ListenerAdd {
            events: shared.bus.kinds_of(&id),
            listener: id,
        });
    }

    pub fn remove_listener(&self, kind: EventKind, id: &ListenerId) -> Result<(), Error> {
        let shared = &self.shared;
        if !shared.bus.detach(kind, id) {
            return Err(Error::NotFound(format!("listener {id}")));
        }
        shared.bus.trigger(Event::ListenerRemove {
            events: shared.bus.kinds_of(id),
            listener: id.clone(),
        });
        Ok(())
    }

    pub fn get_listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.shared.bus.listeners()
    }

    pub fn get_listener_metadata(&self, id: &ListenerId) -> Option<Metadata> {
        let shared = &self.shared;
        shared.bus.metadata(id, shared.clock.as_ref())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.shared.queue.all() {
            match task.status() {
                TaskStatus::Wait => counts.tasks_waiting += 1,
                TaskStatus::Process => counts.tasks_processing += 1,
                TaskStatus::RepeatWait => counts.tasks_repeat_waiting += 1,
                _ => {}
            }
        }
        for record in self.shared.pool.all() {
            match record.status() {
                WorkerStatus::Wait => counts.workers_waiting += 1,
                WorkerStatus::Process => counts.workers_processing += 1,
                WorkerStatus::Cancel => {}
            }
        }
        counts
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn status(&self) -> DispatcherStatus {
        DispatcherStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: DispatcherStatus) {
        let previous =
            DispatcherStatus::from_u8(self.status.swap(status.as_u8(), Ordering::AcqRel));
        self.bus.trigger(Event::DispatcherStatusChanged {
            current: status,
            previous,
        });
    }

    fn set_task_status(&self, task: &Arc<Task>, status: TaskStatus) {
        let previous = task.set_status(status);
        self.bus.trigger(Event::TaskStatusChanged {
            task: Arc::clone(task),
            metadata: task.metadata(self.clock.as_ref()),
            current: status,
            previous,
        });
    }

    fn set_worker_status(&self, record: &Arc<WorkerRecord>, status: WorkerStatus) {
        let previous = record.set_status(status);
        self.bus.trigger(Event::WorkerStatusChanged {
            worker: Arc::clone(record.worker()),
            metadata: record.metadata(self.clock.as_ref()),
            current: status,
            previous,
        });
    }

    /// Edge-triggered wakeup for the dispatch cycle. The channel holds one
    /// slot; a full channel already means a wakeup is pending, so the send
    /// is dropped rather than awaited.
    fn notify(&self) {
        let _ = self.notify_tx.try_send(());
    }
}

async fn dispatch_cycle(shared: Arc<Shared>, mut notify_rx: mpsc::Receiver<()>) {
    loop {
        let tick = *shared.tick.lock().unwrap();
        let next_parked = shared.queue.next_eligible_at();
        tokio::select! {
            _ = shared.root.cancelled() => return,
            _ = notify_rx.recv() => {}
            // fallback tick: a wakeup lost to a race must not starve the queue
            _ = shared.clock.sleep(tick), if !tick.is_zero() => {}
            _ = shared.clock.sleep_until(next_parked.unwrap_or_else(|| shared.clock.now())),
                if next_parked.is_some() => {}
        }
        execute_ready(&shared);
    }
}

/// Pair up ready tasks with idle workers until either side runs dry.
fn execute_ready(shared: &Arc<Shared>) {
    if shared.status() != DispatcherStatus::Process {
        return;
    }
    loop {
        let worker = shared.pool.pull();
        let task = shared.queue.pull(shared.clock.now());
        match (worker, task) {
            (Some(record), Some(task)) => {
                shared.bus.trigger(Event::TaskExecuteStart {
                    task: Arc::clone(&task),
                    task_metadata: task.metadata(shared.clock.as_ref()),
                    worker: Arc::clone(record.worker()),
                    worker_metadata: record.metadata(shared.clock.as_ref()),
                });
                shared
                    .tracker
                    .spawn(task_carrier(Arc::clone(shared), record, task));
            }
            (record, task) => {
                if let Some(record) = record {
                    if let Err(err) = shared.pool.check_in(&record) {
                        warn!(worker = %record.id(), %err, "unmatched worker lost on check-in");
                    }
                }
                if let Some(task) = task {
                    shared.queue.restore(&task);
                }
                return;
            }
        }
    }
}

/// One in-flight execution: runs the worker on its own tokio task so a
/// panicking function is caught at the join boundary, then waits for the
/// first of {completion, deadline, cancellation}.
async fn task_carrier(shared: Arc<Shared>, record: Arc<WorkerRecord>, task: Arc<Task>) {
    record.set_current_task(Some(Arc::clone(&task)));
    shared.set_worker_status(&record, WorkerStatus::Process);

    let attempt = task.begin_attempt(shared.clock.now());
    shared.set_task_status(&task, TaskStatus::Process);

    let token = shared.root.child_token();
    task.set_cancel(token.clone());
    record.set_cancel(token.clone());

    let timeout = task.timeout();
    let ctx = TaskContext::new(attempt, token.clone(), Arc::clone(&task));
    let worker = Arc::clone(record.worker());
    let mut run = {
        let task = Arc::clone(&task);
        tokio::spawn(async move { worker.run_task(ctx, task).await })
    };

    let (value, error, cancelled) = tokio::select! {
        outcome = &mut run => match outcome {
            Ok(Ok(value)) => (Some(value), None, false),
            Ok(Err(err)) => (None, Some(err), false),
            Err(join_err) => (panic_payload(join_err), Some(TaskError::Panicked), false),
        },
        _ = shared.clock.sleep(timeout), if !timeout.is_zero() => {
            // deadline passed; the function is asked to stop but not killed
            token.cancel();
            (None, Some(TaskError::TimedOut), false)
        }
        _ = token.cancelled() => {
            (None, Some(TaskError::Cancelled), true)
        }
    };

    task.finish_attempt(shared.clock.now(), error.clone());
    token.cancel();

    let completion = Completion {
        record,
        task,
        value,
        error,
        cancelled,
    };
    if shared.results_tx.send(completion).is_err() {
        debug!("result collector is gone, completion dropped");
    }
}

fn panic_payload(err: tokio::task::JoinError) -> Option<Value> {
    if !err.is_panic() {
        return None;
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        return Some(Value::String((*message).into()));
    }
    payload
        .downcast_ref::<String>()
        .map(|message| Value::String(message.clone()))
}

async fn result_collector(shared: Arc<Shared>, mut results_rx: mpsc::UnboundedReceiver<Completion>) {
    loop {
        tokio::select! {
            _ = shared.root.cancelled() => return,
            completion = results_rx.recv() => match completion {
                Some(completion) => process_completion(&shared, completion),
                None => return,
            }
        }
    }
}

fn process_completion(shared: &Arc<Shared>, completion: Completion) {
    let Completion {
        record,
        task,
        value,
        error,
        cancelled,
    } = completion;

    task.clear_cancel();
    record.clear_cancel();

    if shared.status() == DispatcherStatus::Cancel {
        return;
    }

    record.set_current_task(None);

    // a worker cancelled on its own (removal) stays out of the pool
    if !cancelled || record.status() != WorkerStatus::Cancel {
        shared.set_worker_status(&record, WorkerStatus::Wait);
        if let Err(err) = shared.pool.check_in(&record) {
            warn!(worker = %record.id(), %err, "worker lost on check-in");
        }
    }

    if cancelled {
        if task.status() != TaskStatus::Cancel {
            // cancelled through its worker rather than remove_task
            shared.set_task_status(&task, TaskStatus::Cancel);
        }
        shared.queue.remove(task.id());
    } else if task.status() != TaskStatus::Cancel {
        let status = match &error {
            None => TaskStatus::Success,
            Some(TaskError::TimedOut) => TaskStatus::FailByTimeout,
            Some(_) => TaskStatus::Fail,
        };
        shared.set_task_status(&task, status);

        let repeats = task.repeats();
        if repeats < 0 || i64::from(task.attempts()) < repeats {
            let interval = task.repeat_interval();
            if !interval.is_zero() {
                task.set_allow_start_at(Some(shared.clock.now() + interval));
            }
            shared.set_task_status(&task, TaskStatus::RepeatWait);
            if let Err(err) = shared.queue.requeue(&task, shared.clock.now()) {
                warn!(task = %task.id(), %err, "task lost on requeue");
            }
        } else {
            shared.queue.remove(task.id());
        }
    }

    shared.bus.trigger(Event::TaskExecuteStop {
        task: Arc::clone(&task),
        task_metadata: task.metadata(shared.clock.as_ref()),
        worker: Arc::clone(record.worker()),
        worker_metadata: record.metadata(shared.clock.as_ref()),
        value,
        error,
    });
    shared.notify();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::WorkerId;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    struct EventLog {
        id: ListenerId,
        seen: Mutex<Vec<Event>>,
    }

    impl EventLog {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: ListenerId::new(id),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self, kind: EventKind) -> usize {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.kind() == kind)
                .count()
        }

        fn stop_values(&self) -> Vec<Option<Value>> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    Event::TaskExecuteStop { value, .. } => Some(value.clone()),
                    _ => None,
                })
                .collect()
        }

        fn task_transitions(&self) -> Vec<(TaskStatus, TaskStatus)> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    Event::TaskStatusChanged {
                        previous, current, ..
                    } => Some((*previous, *current)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Listener for EventLog {
        fn id(&self) -> &ListenerId {
            &self.id
        }

        async fn notify(&self, event: Event) {
            self.seen.lock().unwrap().push(event);
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..20_000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached in time");
    }

    fn worker(n: usize) -> Arc<SimpleWorker> {
        Arc::new(SimpleWorker::new(WorkerId::new(format!("worker-{n}"))))
    }

    fn start(dispatcher: &Dispatcher) -> tokio::task::JoinHandle<Result<(), Error>> {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    }

    async fn stop(
        dispatcher: &Dispatcher,
        runner: tokio::task::JoinHandle<Result<(), Error>>,
    ) {
        dispatcher.cancel().unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn single_task_runs_to_success() {
        let dispatcher = Dispatcher::new();
        let log = EventLog::new("listener-log");
        dispatcher.add_listener(EventKind::TaskExecuteStop, log.clone());
        dispatcher.add_worker(worker(1)).unwrap();

        let task = dispatcher.add_task_fn(|_ctx| async { Ok(Value::from("ok")) }, vec![]);
        let runner = start(&dispatcher);

        wait_until(|| task.status() == TaskStatus::Success).await;
        assert_eq!(task.attempts(), 1);
        assert!(task.last_error().is_none());

        wait_until(|| log.count(EventKind::TaskExecuteStop) == 1).await;
        assert_eq!(log.stop_values(), vec![Some(Value::from("ok"))]);

        // terminal tasks leave the queue
        assert!(dispatcher.get_tasks().is_empty());

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_classified_and_bounded() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();

        let task = Arc::new(
            Task::new(TaskId::new("task-slow"), |_ctx| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Value::Null)
            })
            .with_timeout(Duration::from_millis(10)),
        );
        dispatcher.add_task(Arc::clone(&task));
        let runner = start(&dispatcher);

        wait_until(|| task.status() == TaskStatus::FailByTimeout).await;
        assert_eq!(task.attempts(), 1);
        assert_eq!(task.last_error(), Some(TaskError::TimedOut));

        let elapsed = task.finished_at().unwrap() - task.last_started_at().unwrap();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(15));

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_attempts_retry_until_success() {
        let dispatcher = Dispatcher::new();
        let log = EventLog::new("listener-log");
        dispatcher.add_listener(EventKind::TaskStatusChanged, log.clone());
        dispatcher.add_worker(worker(1)).unwrap();

        let task = Arc::new(
            Task::new(TaskId::new("task-flaky"), |ctx| async move {
                if ctx.attempt() < 3 {
                    Err(TaskError::Failed(format!(
                        "intentional failure (attempt={})",
                        ctx.attempt()
                    )))
                } else {
                    Ok(Value::Null)
                }
            })
            .with_repeats(3),
        );
        dispatcher.add_task(Arc::clone(&task));
        let runner = start(&dispatcher);

        wait_until(|| task.status() == TaskStatus::Success).await;
        assert_eq!(task.attempts(), 3);

        wait_until(|| {
            log.task_transitions()
                .iter()
                .filter(|t| *t == &(TaskStatus::Fail, TaskStatus::RepeatWait))
                .count()
                == 2
        })
        .await;

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_exhausted_after_repeats_attempts() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();

        let task = Arc::new(
            Task::new(TaskId::new("task-doomed"), |_ctx| async {
                Err(TaskError::Failed("always failing".into()))
            })
            .with_repeats(4),
        );
        dispatcher.add_task(Arc::clone(&task));
        let runner = start(&dispatcher);

        wait_until(|| task.status() == TaskStatus::Fail && task.attempts() == 4).await;
        // no further attempts after the budget
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(task.attempts(), 4);
        assert!(dispatcher.get_tasks().is_empty());

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_function_fails_with_panic_recovered() {
        let dispatcher = Dispatcher::new();
        let log = EventLog::new("listener-log");
        dispatcher.add_listener(EventKind::TaskExecuteStop, log.clone());
        dispatcher.add_worker(worker(1)).unwrap();

        let task = dispatcher.add_task_fn(|_ctx| async { panic!("boom") }, vec![]);
        let runner = start(&dispatcher);

        wait_until(|| task.status() == TaskStatus::Fail).await;
        assert_eq!(task.last_error(), Some(TaskError::Panicked));
        assert_eq!(task.last_error().unwrap().to_string(), "panic recovered");

        // the original panic payload rides along in the stop event
        wait_until(|| log.count(EventKind::TaskExecuteStop) == 1).await;
        assert_eq!(log.stop_values(), vec![Some(Value::from("boom"))]);

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn two_workers_bound_concurrency() {
        let dispatcher = Dispatcher::new();
        let log = EventLog::new("listener-log");
        dispatcher.add_listener(EventKind::TaskExecuteStart, log.clone());
        dispatcher.add_listener(EventKind::TaskExecuteStop, log.clone());
        dispatcher.add_worker(worker(1)).unwrap();
        dispatcher.add_worker(worker(2)).unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for n in 0..10 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let task = Arc::new(Task::new(
                TaskId::new(format!("task-{n:02}")),
                move |_ctx| {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                },
            ));
            dispatcher.add_task(Arc::clone(&task));
            tasks.push(task);
        }

        let started = Instant::now();
        let runner = start(&dispatcher);

        wait_until(|| tasks.iter().all(|t| t.status() == TaskStatus::Success)).await;

        // 10 tasks of 50ms over 2 slots: five sequential batches
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        // every start has exactly one stop
        wait_until(|| log.count(EventKind::TaskExecuteStop) == 10).await;
        assert_eq!(log.count(EventKind::TaskExecuteStart), 10);

        // quiescence: both workers idle again, nothing queued
        wait_until(|| {
            let counts = dispatcher.counts();
            counts.workers_waiting == 2 && counts.workers_processing == 0
        })
        .await;
        assert!(dispatcher.get_tasks().is_empty());

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn remove_task_cancels_in_flight_execution() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();

        let task = dispatcher.add_task_fn(
            |ctx| async move {
                ctx.cancellation().cancelled().await;
                Err(TaskError::Cancelled)
            },
            vec![],
        );
        let runner = start(&dispatcher);

        wait_until(|| task.status() == TaskStatus::Process).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        dispatcher.remove_task(task.id()).unwrap();

        wait_until(|| task.status() == TaskStatus::Cancel).await;
        assert!(dispatcher.get_tasks().is_empty());

        // the worker returns to the pool and picks up new work
        wait_until(|| dispatcher.counts().workers_waiting == 1).await;
        let follow_up = dispatcher.add_task_fn(|_ctx| async { Ok(Value::Null) }, vec![]);
        wait_until(|| follow_up.status() == TaskStatus::Success).await;

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn remove_worker_cancels_its_task_and_leaves() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();

        // ignores its token entirely; only the carrier's cancel arm can end it
        let task = dispatcher.add_task_fn(|_ctx| std::future::pending(), vec![]);
        let runner = start(&dispatcher);

        wait_until(|| task.status() == TaskStatus::Process).await;
        dispatcher
            .remove_worker(&WorkerId::new("worker-1"))
            .unwrap();

        wait_until(|| task.status() == TaskStatus::Cancel).await;
        assert!(dispatcher.get_workers().is_empty());
        assert!(dispatcher.get_tasks().is_empty());

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn allow_start_at_delays_the_first_attempt() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();
        let runner = start(&dispatcher);

        let clock = TokioClock;
        let eligible_at = clock.now() + Duration::from_millis(100);
        let task = Arc::new(
            Task::new(TaskId::new("task-later"), |_ctx| async { Ok(Value::Null) })
                .with_allow_start_at(eligible_at),
        );
        dispatcher.add_task(Arc::clone(&task));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.status(), TaskStatus::Wait);

        wait_until(|| task.status() == TaskStatus::Success).await;
        assert!(task.first_started_at().unwrap() >= eligible_at);

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_interval_spaces_attempts() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();

        let task = Arc::new(
            Task::new(TaskId::new("task-spaced"), |_ctx| async {
                Err(TaskError::Failed("again".into()))
            })
            .with_repeats(2)
            .with_repeat_interval(Duration::from_millis(200)),
        );
        dispatcher.add_task(Arc::clone(&task));
        let runner = start(&dispatcher);

        wait_until(|| task.attempts() == 2 && task.status() == TaskStatus::Fail).await;

        let gap = task.last_started_at().unwrap() - task.first_started_at().unwrap();
        assert!(gap >= Duration::from_millis(200), "gap {gap:?}");

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_repeats_run_until_cancelled() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();

        let task = Arc::new(
            Task::new(TaskId::new("task-forever"), |_ctx| async {
                Err(TaskError::Failed("still failing".into()))
            })
            .with_repeats(-1),
        );
        dispatcher.add_task(Arc::clone(&task));
        let runner = start(&dispatcher);

        wait_until(|| task.attempts() >= 5).await;
        dispatcher.remove_task(task.id()).unwrap();
        wait_until(|| task.status() == TaskStatus::Cancel).await;

        stop(&dispatcher, runner).await;
    }

    #[tokio::test(start_paused = true)]
    async fn run_rejects_a_second_caller() {
        let dispatcher = Dispatcher::new();
        let runner = start(&dispatcher);
        wait_until(|| dispatcher.status() == DispatcherStatus::Process).await;

        assert!(matches!(
            dispatcher.run().await,
            Err(Error::PolicyViolation(_))
        ));

        stop(&dispatcher, runner).await;
        assert_eq!(dispatcher.status(), DispatcherStatus::Wait);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_workers_and_tasks() {
        let dispatcher = Dispatcher::new();
        let log = EventLog::new("listener-log");
        dispatcher.add_listener(EventKind::DispatcherStatusChanged, log.clone());
        dispatcher.add_worker(worker(1)).unwrap();

        let task = dispatcher.add_task_fn(
            |ctx| async move {
                ctx.cancellation().cancelled().await;
                Err(TaskError::Cancelled)
            },
            vec![],
        );
        let runner = start(&dispatcher);
        wait_until(|| task.status() == TaskStatus::Process).await;

        stop(&dispatcher, runner).await;

        assert_eq!(task.status(), TaskStatus::Cancel);
        assert_eq!(dispatcher.status(), DispatcherStatus::Wait);

        // Wait -> Process -> Cancel -> Wait
        wait_until(|| log.count(EventKind::DispatcherStatusChanged) == 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_getters_round_trip() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();
        let task = dispatcher.add_named_task_fn(
            "lookup",
            |_ctx| async { Ok(Value::Null) },
            vec![Value::from(42)],
        );

        let meta = dispatcher.get_task_metadata(task.id()).unwrap();
        assert_eq!(meta["name"], "lookup");
        assert_eq!(meta["status"], "wait");

        let meta = dispatcher
            .get_worker_metadata(&WorkerId::new("worker-1"))
            .unwrap();
        assert_eq!(meta["status"], "wait");

        assert!(dispatcher
            .get_task_metadata(&TaskId::new("task-unknown"))
            .is_none());
        assert!(matches!(
            dispatcher.remove_task(&TaskId::new("task-unknown")),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            dispatcher.remove_worker(&WorkerId::new("worker-unknown")),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn listener_registry_fires_add_and_remove_events() {
        let dispatcher = Dispatcher::new();
        let log = EventLog::new("listener-log");
        dispatcher.add_listener(EventKind::ListenerAdd, log.clone());
        dispatcher.add_listener(EventKind::ListenerRemove, log.clone());

        let other = EventLog::new("listener-other");
        dispatcher.add_listener(EventKind::TaskAdd, other.clone());
        wait_until(|| log.count(EventKind::ListenerAdd) >= 1).await;

        dispatcher
            .remove_listener(EventKind::TaskAdd, &ListenerId::new("listener-other"))
            .unwrap();
        wait_until(|| log.count(EventKind::ListenerRemove) == 1).await;

        assert!(matches!(
            dispatcher.remove_listener(EventKind::TaskAdd, &ListenerId::new("listener-other")),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_worker_registration_is_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();
        assert!(matches!(
            dispatcher.add_worker(worker(1)),
            Err(Error::PolicyViolation(_))
        ));

        let generated = dispatcher.add_simple_worker().unwrap();
        assert!(generated.as_str().starts_with("worker-"));
        assert_eq!(dispatcher.get_workers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_added_before_run_start_when_run_begins() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_worker(worker(1)).unwrap();
        let task = dispatcher.add_task_fn(|_ctx| async { Ok(Value::Null) }, vec![]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.status(), TaskStatus::Wait);

        let runner = start(&dispatcher);
        wait_until(|| task.status() == TaskStatus::Success).await;

        stop(&dispatcher, runner).await;
    }
}
