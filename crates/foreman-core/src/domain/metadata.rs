//! Metadata views: string keys to opaque JSON values.

use serde_json::Value;
use tokio::time::Instant;

use crate::ports::Clock;

/// Metadata shape shared by tasks, workers and listeners.
///
/// Well-known keys: every item carries `id`, `status` and `created_at`;
/// tasks add `name`, `attempts`, `first_started_at`, `last_started_at`,
/// `finished_at` and `last_error`; workers add `task_id` while busy;
/// listeners add `events`.
pub type Metadata = serde_json::Map<String, Value>;

/// Render an optional monotonic instant as an RFC 3339 wall time.
///
/// Monotonic instants are what the core schedules with; the wall time is
/// reconstructed through the clock port only at the metadata boundary.
pub(crate) fn wall_value(clock: &dyn Clock, at: Option<Instant>) -> Value {
    match at {
        Some(at) => Value::String(clock.wall_time(at).to_rfc3339()),
        None => Value::Null,
    }
}
