//! foreman-core
//!
//! In-process task dispatcher with a bounded worker pool.
//!
//! The crate is split into small modules:
//! - domain: ids, statuses, tasks, events, metadata views
//! - ports: Clock and IdSource seams (injectable for tests)
//! - pool / queue: idle-worker set and FIFO-with-delay task queue
//! - listener: asynchronous event fan-out
//! - worker: the Worker contract and the managed per-slot record
//! - dispatcher: the matching loop, result collection, retries, shutdown
//! - error: crate-level error types

pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod listener;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod queue;
pub mod worker;
