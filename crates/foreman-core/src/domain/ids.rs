//! Strongly-typed identifiers.
//!
//! Ids are opaque strings underneath; the phantom marker keeps `TaskId`,
//! `WorkerId` and `ListenerId` from being mixed up at compile time while the
//! runtime representation stays a plain string (embedders may bring their own
//! naming scheme for workers and listeners).

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marker trait for each id type.
///
/// `prefix()` is the conventional prefix used by generated ids
/// (see `UlidIdSource`); hand-made ids are free to ignore it.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic string-backed id.
///
/// `T` is phantom and costs nothing at runtime; it only prevents passing a
/// worker id where a task id is expected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Marker for task ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskTag {}

impl IdMarker for TaskTag {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Marker for worker ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerTag {}

impl IdMarker for WorkerTag {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Marker for listener ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerTag {}

impl IdMarker for ListenerTag {
    fn prefix() -> &'static str {
        "listener-"
    }
}

/// Identifier of a Task (one unit-of-work descriptor).
pub type TaskId = Id<TaskTag>;

/// Identifier of a Worker (one execution slot).
pub type WorkerId = Id<WorkerTag>;

/// Identifier of a Listener (one event consumer).
pub type ListenerId = Id<ListenerTag>;
