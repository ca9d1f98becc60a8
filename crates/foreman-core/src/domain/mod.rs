//! Domain model (ids, statuses, tasks, events, metadata views).

pub mod events;
pub mod ids;
pub mod metadata;
pub mod status;
pub mod task;

pub use events::{Event, EventKind};
pub use ids::{Id, IdMarker, ListenerId, TaskId, WorkerId};
pub use metadata::Metadata;
pub use status::{DispatcherStatus, TaskStatus, WorkerStatus};
pub use task::{BoxTaskFuture, Task, TaskContext, TaskFn};
