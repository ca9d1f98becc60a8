//! Ports: the contracts the core consumes instead of ambient services.
//!
//! Wall clocks, timers and identifier generation are injected through these
//! traits; production wiring uses `TokioClock` and `UlidIdSource`.

pub mod clock;
pub mod id_source;

pub use clock::{Clock, ManualClock, TokioClock};
pub use id_source::{IdSource, UlidIdSource};
