use super::observable::Payload;
use crate::error::{BoxError, EventError};

use std::sync::{Arc, Weak};

pub type ListenerResult = Result<(), BoxError>;

/// Synchronous value callback.
///
/// Any `Fn(T)` closure is a listener. Closures which can fail are wrapped in
/// [Fallible]; a returned error becomes an error signal on the event the
/// listener is connected to.
pub trait Listener<T>: Send + Sync {
  fn receive(&self, value: T) -> ListenerResult;
}

impl<T, F> Listener<T> for F
where
  F: Fn(T) + Send + Sync,
{
  fn receive(&self, value: T) -> ListenerResult {
    self(value);
    Ok(())
  }
}

pub struct Fallible<F>(pub F);

impl<T, E, F> Listener<T> for Fallible<F>
where
  F: Fn(T) -> Result<(), E> + Send + Sync,
  E: Into<BoxError>,
{
  fn receive(&self, value: T) -> ListenerResult {
    (self.0)(value).map_err(Into::into)
  }
}

pub(crate) type ErrorHandler = Arc<dyn Fn(&EventError) + Send + Sync>;
pub(crate) type DoneHandler = Arc<dyn Fn() + Send + Sync>;

enum Target<T> {
  Strong(Arc<dyn Listener<T>>),
  Weak(Weak<dyn Listener<T>>),
}

impl<T> Target<T> {
  fn upgrade(&self) -> Option<Arc<dyn Listener<T>>> {
    match self {
      Target::Strong(listener) => Some(listener.clone()),
      Target::Weak(listener) => listener.upgrade(),
    }
  }
}

fn key_of<L: ?Sized>(listener: *const L) -> usize {
  listener as *const () as usize
}

/// Describes one registration on an event: an optional value listener, held
/// strongly or weakly, plus optional error and done callbacks.
///
/// # Example
/// ```
/// use eventflow::event::dispatcher::Connection;
/// use eventflow::Event;
/// use std::sync::Arc;
///
/// let event = Event::<i32>::new();
/// let listener = Arc::new(|x: i32| println!("{}", x));
/// let subscription = event
///   .connect(Connection::weak(&listener).on_done(|| println!("done")))
///   .unwrap();
/// assert!(event.connect(Connection::strong(listener.clone())).is_err());
/// subscription.disconnect();
/// ```
pub struct Connection<T> {
  target: Option<Target<T>>,
  key: Option<usize>,
  error: Option<ErrorHandler>,
  done: Option<DoneHandler>,
}

impl<T> Connection<T>
where
  T: Payload,
{
  pub fn strong<L>(listener: Arc<L>) -> Self
  where
    L: Listener<T> + 'static,
  {
    let key = key_of(Arc::as_ptr(&listener));
    Connection {
      target: Some(Target::Strong(listener)),
      key: Some(key),
      error: None,
      done: None,
    }
  }

  /// The event does not keep `listener` alive. Once the last strong
  /// reference is gone the registration is skipped and pruned.
  pub fn weak<L>(listener: &Arc<L>) -> Self
  where
    L: Listener<T> + 'static,
  {
    let weak: Weak<L> = Arc::downgrade(listener);
    let weak: Weak<dyn Listener<T>> = weak;
    Connection {
      target: Some(Target::Weak(weak)),
      key: Some(key_of(Arc::as_ptr(listener))),
      error: None,
      done: None,
    }
  }

  pub fn func<F>(listener: F) -> Self
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    Self::strong(Arc::new(listener))
  }

  /// A registration without a value listener.
  pub fn detached() -> Self {
    Connection {
      target: None,
      key: None,
      error: None,
      done: None,
    }
  }

  pub fn on_error<F>(mut self, handler: F) -> Self
  where
    F: Fn(&EventError) + Send + Sync + 'static,
  {
    self.error = Some(Arc::new(handler));
    self
  }

  pub fn on_done<F>(mut self, handler: F) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.done = Some(Arc::new(handler));
    self
  }

  pub(crate) fn take_done(&mut self) -> Option<DoneHandler> {
    self.done.take()
  }
}

pub(crate) struct Slot<T> {
  pub(crate) id: usize,
  pub(crate) transient: bool,
  key: Option<usize>,
  target: Option<Target<T>>,
  error: Option<ErrorHandler>,
  done: Option<DoneHandler>,
}

impl<T> Slot<T> {
  fn alive(&self) -> bool {
    match &self.target {
      Some(Target::Weak(listener)) => listener.strong_count() > 0,
      _ => true,
    }
  }
}

/// Ordered listener registry of one event.
///
/// Dispatch always works on a snapshot so that registrations may change while
/// a pass is in progress without affecting the listeners already scheduled.
pub(crate) struct Dispatcher<T> {
  slots: Vec<Slot<T>>,
  next_id: usize,
}

impl<T> Default for Dispatcher<T> {
  fn default() -> Self {
    Dispatcher {
      slots: Vec::new(),
      next_id: 0,
    }
  }
}

impl<T> Dispatcher<T> {
  /// Registers `connection` unless its listener is already registered, in
  /// which case the connection is handed back.
  pub(crate) fn insert(
    &mut self,
    connection: Connection<T>,
    transient: bool,
  ) -> Result<usize, Connection<T>> {
    if let Some(key) = connection.key {
      if self
        .slots
        .iter()
        .any(|slot| slot.key == Some(key) && slot.alive())
      {
        return Err(connection);
      }
    }
    Ok(self.push(connection, transient))
  }

  /// Registers `connection` without the duplicate check.
  pub(crate) fn push(&mut self, connection: Connection<T>, transient: bool) -> usize {
    self.next_id += 1;
    self.slots.push(Slot {
      id: self.next_id,
      transient,
      key: connection.key,
      target: connection.target,
      error: connection.error,
      done: connection.done,
    });
    self.next_id
  }

  pub(crate) fn remove(&mut self, id: usize) -> Option<Slot<T>> {
    let idx = self.slots.iter().position(|slot| slot.id == id)?;
    Some(self.slots.remove(idx))
  }

  pub(crate) fn position_of<L: ?Sized>(&self, listener: *const L) -> Option<usize> {
    let key = key_of(listener);
    self
      .slots
      .iter()
      .find(|slot| slot.key == Some(key) && slot.alive())
      .map(|slot| slot.id)
  }

  /// Live value listeners in registration order, and whether a dead weak
  /// registration was found on the way.
  pub(crate) fn targets(&self) -> (Vec<Arc<dyn Listener<T>>>, bool) {
    let mut dead = false;
    let mut targets = Vec::with_capacity(self.slots.len());
    for slot in self.slots.iter() {
      if let Some(target) = &slot.target {
        match target.upgrade() {
          Some(listener) => targets.push(listener),
          None => dead = true,
        }
      }
    }
    (targets, dead)
  }

  pub(crate) fn error_handlers(&self) -> Vec<ErrorHandler> {
    self
      .slots
      .iter()
      .filter(|slot| slot.alive())
      .filter_map(|slot| slot.error.clone())
      .collect()
  }

  pub(crate) fn done_handlers(&self) -> Vec<DoneHandler> {
    self
      .slots
      .iter()
      .filter(|slot| slot.alive())
      .filter_map(|slot| slot.done.clone())
      .collect()
  }

  /// Removes dead weak registrations and hands them back so they are dropped
  /// outside of any lock.
  pub(crate) fn prune(&mut self) -> Vec<Slot<T>> {
    let (alive, dead) = std::mem::take(&mut self.slots)
      .into_iter()
      .partition(|slot| slot.alive());
    self.slots = alive;
    dead
  }

  pub(crate) fn clear(&mut self) -> Vec<Slot<T>> {
    std::mem::take(&mut self.slots)
  }

  pub(crate) fn len(&self) -> usize {
    self.slots.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[test]
  fn insert_order_test() {
    let mut dispatcher = Dispatcher::<i32>::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..3 {
      let seen = seen.clone();
      dispatcher
        .insert(Connection::func(move |x: i32| seen.lock().unwrap().push((tag, x))), false)
        .ok()
        .unwrap();
    }
    let (targets, dead) = dispatcher.targets();
    assert!(!dead);
    for target in targets {
      target.receive(7).unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), [(0, 7), (1, 7), (2, 7)]);
  }

  #[test]
  fn duplicate_listener_test() {
    let mut dispatcher = Dispatcher::<i32>::default();
    let listener = Arc::new(|_: i32| {});
    assert!(dispatcher.insert(Connection::strong(listener.clone()), false).is_ok());
    assert!(dispatcher.insert(Connection::strong(listener.clone()), false).is_err());
    assert!(dispatcher.insert(Connection::weak(&listener), false).is_err());
    assert_eq!(dispatcher.len(), 1);
  }

  #[test]
  fn weak_listener_prune_test() {
    let mut dispatcher = Dispatcher::<i32>::default();
    let counter = Arc::new(AtomicUsize::new(0));
    let captured = counter.clone();
    let listener = Arc::new(move |_: i32| {
      captured.fetch_add(1, Ordering::Relaxed);
    });
    dispatcher.push(Connection::weak(&listener), false);
    let (targets, _) = dispatcher.targets();
    assert_eq!(targets.len(), 1);
    drop(targets);
    drop(listener);
    let (targets, dead) = dispatcher.targets();
    assert!(targets.is_empty());
    assert!(dead);
    assert_eq!(dispatcher.prune().len(), 1);
    assert!(dispatcher.is_empty());
  }

  #[test]
  fn fallible_listener_test() {
    let listener = Fallible(|x: i32| if x > 0 { Ok(()) } else { Err("negative") });
    assert!(listener.receive(1).is_ok());
    assert_eq!(listener.receive(-1).unwrap_err().to_string(), "negative");
  }

  #[test]
  fn handler_collection_test() {
    let mut dispatcher = Dispatcher::<i32>::default();
    dispatcher.push(Connection::detached().on_error(|_| {}), false);
    dispatcher.push(Connection::detached().on_done(|| {}), true);
    assert_eq!(dispatcher.error_handlers().len(), 1);
    assert_eq!(dispatcher.done_handlers().len(), 1);
    assert!(dispatcher.targets().0.is_empty());
    assert_eq!(dispatcher.clear().len(), 2);
  }
}
