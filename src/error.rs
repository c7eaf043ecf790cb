use std::any::Any;
use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = EventError> = std::result::Result<T, E>;

/// Error type returned by fallible listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventError {
  /// Invalid operator or source parameters, reported eagerly.
  #[error("invalid argument: {0}")]
  Construction(String),
  /// A user callback failed or panicked while a signal was dispatched.
  #[error("listener on `{event}` failed: {message}")]
  Listener { event: String, message: String },
  #[error("`{event}` received no value within {after:?}")]
  Timeout { event: String, after: Duration },
  #[error("`{0}` already has an active consumer")]
  ConsumerConflict(String),
  #[error("listener is already connected to `{0}`")]
  AlreadyConnected(String),
  #[error("listener is not connected to `{0}`")]
  NotConnected(String),
  #[error("executor task failed: {0}")]
  Executor(String),
  #[error("{0}")]
  Custom(String),
}

impl EventError {
  pub fn custom(cause: impl Display) -> Self {
    EventError::Custom(cause.to_string())
  }

  pub(crate) fn construction(message: impl Display) -> Self {
    EventError::Construction(message.to_string())
  }

  pub(crate) fn listener(event: &str, cause: impl Display) -> Self {
    EventError::Listener {
      event: event.to_owned(),
      message: cause.to_string(),
    }
  }

  pub(crate) fn from_panic(event: &str, payload: Box<dyn Any + Send>) -> Self {
    Self::listener(event, panic_message(payload.as_ref()))
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, EventError::Timeout { .. })
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    format!("panicked: {}", message)
  } else if let Some(message) = payload.downcast_ref::<String>() {
    format!("panicked: {}", message)
  } else {
    "panicked".to_owned()
  }
}
