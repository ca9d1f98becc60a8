//! Status machines for tasks, workers and the dispatcher.
//!
//! Transitions are driven exclusively by the dispatcher so that every change
//! fires exactly one `*StatusChanged` event; the enums here only describe the
//! shape of each machine.

use serde::{Deserialize, Serialize};

/// Task status.
///
/// Transitions:
/// - Wait -> Process -> Success | Fail | FailByTimeout
/// - Process -> RepeatWait -> Process (while the repeat policy allows it)
/// - any non-terminal -> Cancel (removal or shutdown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, never started.
    Wait,

    /// Currently executing on a worker.
    Process,

    /// Last attempt finished without an error.
    Success,

    /// Last attempt reported an error (or panicked).
    Fail,

    /// Last attempt exceeded its deadline.
    FailByTimeout,

    /// Cancelled by removal or dispatcher shutdown.
    Cancel,

    /// Between attempts, waiting for the repeat policy to release it.
    RepeatWait,
}

impl TaskStatus {
    /// Terminal unless the repeat policy grants another attempt, in which
    /// case the dispatcher moves the task to `RepeatWait` instead.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Fail | TaskStatus::FailByTimeout | TaskStatus::Cancel
        )
    }

    /// Eligible for the queue (pullable once `allow_start_at` has passed).
    pub fn is_pending(self) -> bool {
        matches!(self, TaskStatus::Wait | TaskStatus::RepeatWait)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Wait => "wait",
            TaskStatus::Process => "process",
            TaskStatus::Success => "success",
            TaskStatus::Fail => "fail",
            TaskStatus::FailByTimeout => "fail_by_timeout",
            TaskStatus::Cancel => "cancel",
            TaskStatus::RepeatWait => "repeat_wait",
        }
    }
}

/// Worker status.
///
/// A worker in `Cancel` is never reused; it either drains its in-flight task
/// and leaves, or was removed while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Wait,
    Process,
    Cancel,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Wait => "wait",
            WorkerStatus::Process => "process",
            WorkerStatus::Cancel => "cancel",
        }
    }
}

/// Dispatcher status, stored in an atomic integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherStatus {
    Wait,
    Process,
    Cancel,
}

impl DispatcherStatus {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            DispatcherStatus::Wait => 0,
            DispatcherStatus::Process => 1,
            DispatcherStatus::Cancel => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatcherStatus::Process,
            2 => DispatcherStatus::Cancel,
            _ => DispatcherStatus::Wait,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatcherStatus::Wait => "wait",
            DispatcherStatus::Process => "process",
            DispatcherStatus::Cancel => "cancel",
        }
    }
}
