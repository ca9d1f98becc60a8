//! Lifecycle events fanned out to listeners.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::ids::ListenerId;
use crate::domain::metadata::Metadata;
use crate::domain::status::{DispatcherStatus, TaskStatus, WorkerStatus};
use crate::domain::task::Task;
use crate::error::TaskError;
use crate::worker::Worker;

/// Discriminant used to attach listeners to a class of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DispatcherStatusChanged,
    WorkerAdd,
    WorkerRemove,
    WorkerStatusChanged,
    TaskAdd,
    TaskRemove,
    TaskStatusChanged,
    TaskExecuteStart,
    TaskExecuteStop,
    ListenerAdd,
    ListenerRemove,
}

impl EventKind {
    /// Every kind, in a stable order. Useful for attaching a listener to
    /// the full stream.
    pub const ALL: [EventKind; 11] = [
        EventKind::DispatcherStatusChanged,
        EventKind::WorkerAdd,
        EventKind::WorkerRemove,
        EventKind::WorkerStatusChanged,
        EventKind::TaskAdd,
        EventKind::TaskRemove,
        EventKind::TaskStatusChanged,
        EventKind::TaskExecuteStart,
        EventKind::TaskExecuteStop,
        EventKind::ListenerAdd,
        EventKind::ListenerRemove,
    ];
}

/// Event payloads.
///
/// Metadata fields are snapshots taken at trigger time; listeners run
/// asynchronously and the live objects may have moved on by the time a
/// notification is delivered.
#[derive(Clone)]
pub enum Event {
    DispatcherStatusChanged {
        current: DispatcherStatus,
        previous: DispatcherStatus,
    },
    WorkerAdd {
        worker: Arc<dyn Worker>,
        metadata: Metadata,
    },
    WorkerRemove {
        worker: Arc<dyn Worker>,
        metadata: Metadata,
    },
    WorkerStatusChanged {
        worker: Arc<dyn Worker>,
        metadata: Metadata,
        current: WorkerStatus,
        previous: WorkerStatus,
    },
    TaskAdd {
        task: Arc<Task>,
        metadata: Metadata,
    },
    TaskRemove {
        task: Arc<Task>,
        metadata: Metadata,
    },
    TaskStatusChanged {
        task: Arc<Task>,
        metadata: Metadata,
        current: TaskStatus,
        previous: TaskStatus,
    },
    TaskExecuteStart {
        task: Arc<Task>,
        task_metadata: Metadata,
        worker: Arc<dyn Worker>,
        worker_metadata: Metadata,
    },
    TaskExecuteStop {
        task: Arc<Task>,
        task_metadata: Metadata,
        worker: Arc<dyn Worker>,
        worker_metadata: Metadata,
        value: Option<Value>,
        error: Option<TaskError>,
    },
    ListenerAdd {
        listener: ListenerId,
        events: Vec<EventKind>,
    },
    ListenerRemove {
        listener: ListenerId,
        events: Vec<EventKind>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DispatcherStatusChanged { .. } => EventKind::DispatcherStatusChanged,
            Event::WorkerAdd { .. } => EventKind::WorkerAdd,
            Event::WorkerRemove { .. } => EventKind::WorkerRemove,
            Event::WorkerStatusChanged { .. } => EventKind::WorkerStatusChanged,
            Event::TaskAdd { .. } => EventKind::TaskAdd,
            Event::TaskRemove { .. } => EventKind::TaskRemove,
            Event::TaskStatusChanged { .. } => EventKind::TaskStatusChanged,
            Event::TaskExecuteStart { .. } => EventKind::TaskExecuteStart,
            Event::TaskExecuteStop { .. } => EventKind::TaskExecuteStop,
            Event::ListenerAdd { .. } => EventKind::ListenerAdd,
            Event::ListenerRemove { .. } => EventKind::ListenerRemove,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event::{:?}", self.kind())
    }
}
