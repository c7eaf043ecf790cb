use super::follow_with;
use crate::error::EventError;
use crate::event::observable::{Event, Payload};

/// Forwards everything and ends right after the first error.
pub fn end_on_error<T>(source: &Event<T>) -> Event<T>
where
  T: Payload,
{
  let node = source.derive("end_on_error");
  follow_with(
    source,
    &node,
    |node, value| node.emit(value),
    |node, error| {
      node.emit_error(error);
      node.set_done();
    },
    |node| node.set_done(),
  );
  node
}

/// Recovers from errors: `handler` turns an error into a fallback value, or
/// ends the event by returning `None`. The error itself is not forwarded.
pub fn catch<T, F>(source: &Event<T>, handler: F) -> Event<T>
where
  T: Payload,
  F: Fn(&EventError) -> Option<T> + Send + Sync + 'static,
{
  let node = source.derive("catch");
  follow_with(
    source,
    &node,
    |node, value| node.emit(value),
    move |node, error| match handler(&error) {
      Some(fallback) => node.emit(fallback),
      None => node.set_done(),
    },
    |node| node.set_done(),
  );
  node
}

/// The errors of `source` as values. Ends with `source`.
pub fn errors<T>(source: &Event<T>) -> Event<EventError>
where
  T: Payload,
{
  let node = source.derive("errors");
  follow_with(
    source,
    &node,
    |_, _| {},
    |node, error| node.emit(error),
    |node| node.set_done(),
  );
  node
}

/// Error handling operators.
///
/// # Example
/// ```
/// use eventflow::{EventBuilder, EventError};
/// use eventflow::event::ops::{Misc, Transform};
/// use eventflow::event::scheduler::SchedulerType;
///
/// let source = EventBuilder::new()
///   .scheduler_type(SchedulerType::Virtual)
///   .sequence(vec!["1", "x", "3"]);
/// let parsed = source
///   .try_map(|x| x.parse::<i32>())
///   .catch(|_: &EventError| Some(0));
/// assert_eq!(parsed.run().unwrap(), [1, 0, 3]);
/// ```
pub trait Misc<T>
where
  T: Payload,
{
  fn end_on_error(&self) -> Event<T>;

  fn catch<F>(&self, handler: F) -> Event<T>
  where
    F: Fn(&EventError) -> Option<T> + Send + Sync + 'static;

  fn errors(&self) -> Event<EventError>;
}

impl<T> Misc<T> for Event<T>
where
  T: Payload,
{
  fn end_on_error(&self) -> Event<T> {
    end_on_error(self)
  }

  fn catch<F>(&self, handler: F) -> Event<T>
  where
    F: Fn(&EventError) -> Option<T> + Send + Sync + 'static,
  {
    catch(self, handler)
  }

  fn errors(&self) -> Event<EventError> {
    errors(self)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::scheduler::VirtualScheduler;
  use crate::utils::testing::Recorder;
  use crate::{EventBuilder, Signal};

  fn manual<T: Payload>() -> Event<T> {
    EventBuilder::new()
      .name("manual")
      .scheduler(VirtualScheduler::new())
      .build()
  }

  #[test]
  fn end_on_error_test() {
    let source = manual::<i32>();
    let recorder = Recorder::attach(&source.end_on_error());
    source.emit(1);
    source.emit_error(EventError::custom("stop"));
    source.emit(2);
    assert_eq!(
      recorder.signals(),
      [
        Signal::Value(1),
        Signal::Error(EventError::custom("stop")),
        Signal::Done,
      ]
    );
    assert!(source.is_empty());
    assert!(!source.is_done());
  }

  #[test]
  fn catch_test() {
    let source = manual::<i32>();
    let recovered = Recorder::attach(&source.catch(|error| match error {
      EventError::Custom(message) if message == "soft" => Some(-1),
      _ => None,
    }));
    source.emit(1);
    source.emit_error(EventError::custom("soft"));
    source.emit(2);
    source.emit_error(EventError::custom("hard"));
    source.emit(3);
    assert_eq!(
      recovered.signals(),
      [
        Signal::Value(1),
        Signal::Value(-1),
        Signal::Value(2),
        Signal::Done,
      ]
    );
  }

  #[test]
  fn errors_test() {
    let source = manual::<i32>();
    let recorder = Recorder::attach(&source.errors());
    source.emit(1);
    source.emit_error(EventError::custom("a"));
    source.set_done();
    assert_eq!(
      recorder.signals(),
      [Signal::Value(EventError::custom("a")), Signal::Done]
    );
  }
}
