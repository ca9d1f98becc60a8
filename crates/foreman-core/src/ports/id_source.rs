//! IdSource port.
//!
//! Identifier generation stays outside the core: the dispatcher only asks
//! for fresh ids through this trait. The default source builds ULIDs whose
//! timestamp half comes from the clock port, so generated ids sort by
//! creation time and stay deterministic in their time component under a
//! virtual clock.

use std::sync::Arc;

use ulid::Ulid;

use super::Clock;
use crate::domain::ids::{Id, IdMarker, TaskId, WorkerId};

/// Source of fresh identifiers for dispatcher-created items.
pub trait IdSource: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn worker_id(&self) -> WorkerId;
}

/// ULID-backed id source.
pub struct UlidIdSource {
    clock: Arc<dyn Clock>,
}

impl UlidIdSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn generate<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now_utc().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        Id::new(format!("{}{}", T::prefix(), ulid))
    }
}

impl IdSource for UlidIdSource {
    fn task_id(&self) -> TaskId {
        self.generate()
    }

    fn worker_id(&self) -> WorkerId {
        self.generate()
    }
}
