use crate::error::EventError;

/// The unit of propagation between events.
///
/// Exactly one signal is delivered per emission step. `Done` is terminal: no
/// signal follows it on the same event.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
  Value(T),
  Error(EventError),
  Done,
}

impl<T> Signal<T> {
  pub fn is_value(&self) -> bool {
    matches!(self, Signal::Value(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, Signal::Error(_))
  }

  pub fn is_done(&self) -> bool {
    matches!(self, Signal::Done)
  }

  pub fn value(self) -> Option<T> {
    match self {
      Signal::Value(value) => Some(value),
      _ => None,
    }
  }

  /// `None` for `Done`, otherwise the value or error as a result.
  pub fn into_result(self) -> Option<Result<T, EventError>> {
    match self {
      Signal::Value(value) => Some(Ok(value)),
      Signal::Error(error) => Some(Err(error)),
      Signal::Done => None,
    }
  }

  pub fn map<U, F>(self, func: F) -> Signal<U>
  where
    F: FnOnce(T) -> U,
  {
    match self {
      Signal::Value(value) => Signal::Value(func(value)),
      Signal::Error(error) => Signal::Error(error),
      Signal::Done => Signal::Done,
    }
  }
}
