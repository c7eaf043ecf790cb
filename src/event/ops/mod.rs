//! Operators build derived events out of existing ones.
//!
//! Every operator is a plain function taking the upstream event(s) and its
//! parameters and returning a new [Event]. The family traits ([Select],
//! [Transform], [Aggregate], [Combine], [Timing], [Array], [Misc]) expose the
//! same functions as methods for chaining.
//!
//! Unless documented otherwise an operator:
//! * forwards error signals verbatim,
//! * ends when its upstream ends, releasing its upstream subscription,
//! * converts a panic of a user supplied function into an error signal on
//!   the derived event without ending it.
//!
//! # Example
//! ```
//! use eventflow::{pipe, EventBuilder};
//! use eventflow::event::ops::*;
//! use eventflow::event::scheduler::SchedulerType;
//!
//! let source = EventBuilder::new()
//!   .scheduler_type(SchedulerType::Virtual)
//!   .range(0, 10, 1)
//!   .unwrap();
//! let result = pipe!(
//!   source,
//!   |e| e.filter(|x| x % 2 == 0),
//!   |e| e.map(|x| x * 10),
//!   |e| e.take(3),
//! );
//! assert_eq!(result.run().unwrap(), [0, 20, 40]);
//! ```
pub mod aggregate;
pub mod array;
pub mod combine;
pub mod create;
pub mod misc;
pub mod select;
pub mod timing;
pub mod transform;

pub use aggregate::Aggregate;
pub use array::{Array, WindowStats};
pub use combine::{Combine, Fork};
pub use misc::Misc;
pub use select::Select;
pub use timing::Timing;
pub use transform::{Field, Starred, Transform};

use super::dispatcher::Connection;
use super::observable::{Event, Payload};
use crate::error::EventError;

use std::panic::{self, AssertUnwindSafe};

/// Builds a chain by applying each operator to the result of the previous
/// one, `pipe!(source, a, b)` is `source.pipe(a).pipe(b)`.
#[macro_export]
macro_rules! pipe {
  ($source:expr $(, $operator:expr)* $(,)?) => {{
    let event = $source;
    $(
      let event = event.pipe($operator);
    )*
    event
  }};
}

/// Runs `func`, turning a panic into an error signal on `node`.
pub(crate) fn guard<B, F>(node: &Event<B>, func: F)
where
  B: Payload,
  F: FnOnce(),
{
  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
    node.emit_error(EventError::from_panic(node.name(), payload));
  }
}

/// Connects `node` to `source` with the default error and done handling.
pub(crate) fn follow<T, B, V>(source: &Event<T>, node: &Event<B>, on_value: V)
where
  T: Payload,
  B: Payload,
  V: Fn(&Event<B>, T) + Send + Sync + 'static,
{
  follow_with(
    source,
    node,
    on_value,
    |node, error| node.emit_error(error),
    |node| node.set_done(),
  )
}

/// Connects `node` to `source`. The subscription is owned by `node` and
/// released when `node` is done or dropped.
pub(crate) fn follow_with<T, B, V, E, D>(
  source: &Event<T>,
  node: &Event<B>,
  on_value: V,
  on_error: E,
  on_done: D,
) where
  T: Payload,
  B: Payload,
  V: Fn(&Event<B>, T) + Send + Sync + 'static,
  E: Fn(&Event<B>, EventError) + Send + Sync + 'static,
  D: Fn(&Event<B>) + Send + Sync + 'static,
{
  let values = node.clone();
  let errors = node.clone();
  let done = node.clone();
  let connection = Connection::func(move |value: T| guard(&values, || on_value(&values, value)))
    .on_error(move |error: &EventError| guard(&errors, || on_error(&errors, error.clone())))
    .on_done(move || guard(&done, || on_done(&done)));
  node.add_upstream(source.attach(connection, false));
}

/// A derived event fed by `on_value` with default error and done handling.
pub(crate) fn derive<T, B, V>(source: &Event<T>, operator: &str, on_value: V) -> Event<B>
where
  T: Payload,
  B: Payload,
  V: Fn(&Event<B>, T) + Send + Sync + 'static,
{
  let node = source.derive(operator);
  follow(source, &node, on_value);
  node
}
