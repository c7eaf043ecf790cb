use super::worker::Completion;

/// Runs closures away from the caller and hands back a future of the result.
///
/// A failing or panicking closure resolves the future with an
/// [Executor](crate::error::EventError::Executor) error.
pub trait Executor: Send + Sync {
  fn execute<F, R>(&self, task: F) -> Completion<R>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static;
}
