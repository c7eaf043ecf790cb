//! Eventflow is:
//! * an event primitive which is at the same time a synchronous, multi
//!   listener dispatcher and a single consumer asynchronous stream.
//! * a family of composable operators (select, transform, aggregate, combine,
//!   timing, windowing) building a dataflow graph out of events.
//! * a cooperative scheduler with a simulated clock for deterministic timing.
#[macro_use]
extern crate lazy_static;

pub mod error;
pub mod event;
pub mod sync;
pub mod utils;

pub use error::{EventError, Result};
pub use event::observable::{Event, EventBuilder, Payload};
pub use event::signal::Signal;
