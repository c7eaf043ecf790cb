//! This module contains eventflow's core event system. The module is organized
//! into the following sub modules:
//! * `signal` which implements the [Signal](signal::Signal) algebra: a value,
//!   an error or the terminal done.
//! * `dispatcher` which implements the ordered listener registry.
//! * `observable` which implements the [Event](observable::Event) type - the
//!   dual mode dispatcher/stream node every source and operator is built on.
//! * `consumer` which implements the asynchronous, single consumer side of an
//!   event.
//! * `ops` which contains the operator engine and all of the operator
//!   families.
//! * `scheduler` which implements the timer service used by sources, timing
//!   operators and asynchronous consumption.
//! * `subscription` which implements the
//!   [Subscription](subscription::Subscription) handle used to disconnect a
//!   listener.
//!
pub mod consumer;
pub mod dispatcher;
pub mod observable;
pub mod ops;
pub mod scheduler;
pub mod signal;
pub mod subscription;

pub use observable::{Event, EventBuilder, Payload};
pub use signal::Signal;
