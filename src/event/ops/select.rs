use super::{derive, follow_with};
use crate::event::observable::{Event, Payload};

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub fn filter<T, F>(source: &Event<T>, predicate: F) -> Event<T>
where
  T: Payload,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  derive(source, "filter", move |node, value| {
    if predicate(&value) {
      node.emit(value);
    }
  })
}

/// Forwards the first `count` values, then ends and releases upstream right
/// away.
pub fn take<T>(source: &Event<T>, count: usize) -> Event<T>
where
  T: Payload,
{
  let seen = AtomicUsize::new(0);
  let node = derive(source, "take", move |node: &Event<T>, value| {
    let index = seen.fetch_add(1, Ordering::AcqRel) + 1;
    if index <= count {
      node.emit(value);
    }
    if index >= count {
      node.set_done();
    }
  });
  if count == 0 {
    node.set_done();
  }
  node
}

pub fn skip<T>(source: &Event<T>, count: usize) -> Event<T>
where
  T: Payload,
{
  let seen = AtomicUsize::new(0);
  derive(source, "skip", move |node, value| {
    if seen.fetch_add(1, Ordering::AcqRel) >= count {
      node.emit(value);
    }
  })
}

/// Forwards values while `predicate` holds and ends on the first value for
/// which it does not.
pub fn take_while<T, F>(source: &Event<T>, predicate: F) -> Event<T>
where
  T: Payload,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  derive(source, "take_while", move |node, value| {
    if predicate(&value) {
      node.emit(value);
    } else {
      node.set_done();
    }
  })
}

/// Drops values while `predicate` holds, then forwards everything.
pub fn drop_while<T, F>(source: &Event<T>, predicate: F) -> Event<T>
where
  T: Payload,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  let dropping = AtomicBool::new(true);
  derive(source, "drop_while", move |node, value| {
    if dropping.load(Ordering::Acquire) {
      if predicate(&value) {
        return;
      }
      dropping.store(false, Ordering::Release);
    }
    node.emit(value);
  })
}

/// Forwards values until `notifier` emits its first value.
pub fn take_until<T, U>(source: &Event<T>, notifier: &Event<U>) -> Event<T>
where
  T: Payload,
  U: Payload,
{
  let node = derive(source, "take_until", |node, value| node.emit(value));
  follow_with(
    notifier,
    &node,
    |node, _| node.set_done(),
    |node, error| node.emit_error(error),
    |_| {},
  );
  node
}

/// Forwards a value only if it differs from the previous one.
pub fn changes<T>(source: &Event<T>) -> Event<T>
where
  T: Payload + PartialEq,
{
  let previous: Mutex<Option<T>> = Mutex::new(None);
  derive(source, "changes", move |node, value| {
    let changed = {
      let mut previous = previous.lock().unwrap_or_else(PoisonError::into_inner);
      if previous.as_ref() == Some(&value) {
        false
      } else {
        *previous = Some(value.clone());
        true
      }
    };
    if changed {
      node.emit(value);
    }
  })
}

/// Forwards values never seen before.
pub fn unique<T>(source: &Event<T>) -> Event<T>
where
  T: Payload + Eq + Hash,
{
  let seen: Mutex<HashSet<T>> = Mutex::new(HashSet::new());
  derive(source, "unique", move |node, value| {
    let fresh = seen
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(value.clone());
    if fresh {
      node.emit(value);
    }
  })
}

pub fn first<T>(source: &Event<T>) -> Event<T>
where
  T: Payload,
{
  take(source, 1)
}

/// Emits the last value once upstream ends.
pub fn last<T>(source: &Event<T>) -> Event<T>
where
  T: Payload,
{
  let node = source.derive("last");
  let latest: Arc<Mutex<Option<T>>> = Default::default();
  let (store, flush) = (latest.clone(), latest);
  follow_with(
    source,
    &node,
    move |_, value| *store.lock().unwrap_or_else(PoisonError::into_inner) = Some(value),
    |node, error| node.emit_error(error),
    move |node| {
      let value = flush.lock().unwrap_or_else(PoisonError::into_inner).take();
      if let Some(value) = value {
        node.emit(value);
      }
      node.set_done();
    },
  );
  node
}

/// Filtering and slicing operators.
///
/// # Example
/// ```
/// use eventflow::EventBuilder;
/// use eventflow::event::ops::Select;
/// use eventflow::event::scheduler::SchedulerType;
///
/// let source = EventBuilder::new()
///   .scheduler_type(SchedulerType::Virtual)
///   .sequence(vec![1, 1, 2, 3, 3, 4, 5, 6]);
/// let selected = source.changes().skip(1).take_while(|x| *x < 6);
/// assert_eq!(selected.run().unwrap(), [2, 3, 4, 5]);
/// ```
pub trait Select<T>
where
  T: Payload,
{
  fn filter<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static;

  fn take(&self, count: usize) -> Event<T>;

  fn skip(&self, count: usize) -> Event<T>;

  fn take_while<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static;

  fn drop_while<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static;

  fn take_until<U>(&self, notifier: &Event<U>) -> Event<T>
  where
    U: Payload;

  fn changes(&self) -> Event<T>
  where
    T: PartialEq;

  fn unique(&self) -> Event<T>
  where
    T: Eq + Hash;

  fn first(&self) -> Event<T>;

  fn last(&self) -> Event<T>;
}

impl<T> Select<T> for Event<T>
where
  T: Payload,
{
  fn filter<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    filter(self, predicate)
  }

  fn take(&self, count: usize) -> Event<T> {
    take(self, count)
  }

  fn skip(&self, count: usize) -> Event<T> {
    skip(self, count)
  }

  fn take_while<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    take_while(self, predicate)
  }

  fn drop_while<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    drop_while(self, predicate)
  }

  fn take_until<U>(&self, notifier: &Event<U>) -> Event<T>
  where
    U: Payload,
  {
    take_until(self, notifier)
  }

  fn changes(&self) -> Event<T>
  where
    T: PartialEq,
  {
    changes(self)
  }

  fn unique(&self) -> Event<T>
  where
    T: Eq + Hash,
  {
    unique(self)
  }

  fn first(&self) -> Event<T> {
    first(self)
  }

  fn last(&self) -> Event<T> {
    last(self)
  }
}
