use thiserror::Error;

/// Structural errors returned to API callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    PolicyViolation(String),
}

/// Outcome errors of a single task attempt.
///
/// `Failed` carries whatever the task function reported, verbatim. The other
/// variants are synthesized by the dispatcher and never unwind it; they end
/// up in `last_error` and in the `TaskExecuteStop` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("panic recovered")]
    Panicked,

    #[error("task timed out")]
    TimedOut,

    #[error("task cancelled")]
    Cancelled,
}
