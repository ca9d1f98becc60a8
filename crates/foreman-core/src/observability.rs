use serde::Serialize;

/// Snapshot of tasks and workers by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub tasks_waiting: usize,
    pub tasks_processing: usize,
    pub tasks_repeat_waiting: usize,
    pub workers_waiting: usize,
    pub workers_processing: usize,
}
