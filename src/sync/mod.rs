//! Eventflow synchronization and execution helpers.
//!
//! * `buffer` the ring buffer behind sliding windows.
//! * `task` a future driven to completion on an event scheduler.
//! * `executor` the seam between the `execute` operator and whatever runs the
//!   work.
//! * `worker` worker threads and pools running closures off the event
//!   thread, the stock [Executor](executor::Executor) implementations.
pub mod buffer;
pub mod executor;
pub mod task;
pub mod worker;
