use super::{derive, follow_with};
use crate::error::{EventError, Result};
use crate::event::observable::{Event, Payload};
use crate::sync::task::Job;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A function called with the fields of a tuple as separate arguments.
pub trait Starred<Args, R>: Send + Sync + 'static {
  fn call_starred(&self, args: Args) -> R;
}

macro_rules! impl_starred {
  ($($arg:ident),+) => {
    impl<Func, R, $($arg),+> Starred<($($arg,)+), R> for Func
    where
      Func: Fn($($arg),+) -> R + Send + Sync + 'static,
    {
      #[allow(non_snake_case)]
      fn call_starred(&self, ($($arg,)+): ($($arg,)+)) -> R {
        self($($arg),+)
      }
    }
  };
}

impl_starred!(A);
impl_starred!(A, B);
impl_starred!(A, B, C);
impl_starred!(A, B, C, D);
impl_starred!(A, B, C, D, E);

pub fn map<T, B, F>(source: &Event<T>, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  F: Fn(T) -> B + Send + Sync + 'static,
{
  derive(source, "map", move |node, value| node.emit(func(value)))
}

/// Like [map] for a fallible `func`, an `Err` becomes an error signal.
pub fn try_map<T, B, E, F>(source: &Event<T>, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  E: Display,
  F: Fn(T) -> std::result::Result<B, E> + Send + Sync + 'static,
{
  derive(source, "try_map", move |node: &Event<B>, value| match func(value) {
    Ok(mapped) => node.emit(mapped),
    Err(cause) => node.emit_error(EventError::listener(node.name(), cause)),
  })
}

/// Maps a tuple through a function taking its fields as arguments.
pub fn starmap<T, B, F>(source: &Event<T>, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  F: Starred<T, B>,
{
  derive(source, "starmap", move |node, value| {
    node.emit(func.call_starred(value))
  })
}

/// Values with fields looked up by key, see [pluck].
pub trait Field<K> {
  type Output: Payload;

  fn field(&self, key: &K) -> Option<Self::Output>;
}

impl<K, V, S> Field<K> for HashMap<K, V, S>
where
  K: Eq + Hash,
  V: Payload,
  S: BuildHasher,
{
  type Output = V;

  fn field(&self, key: &K) -> Option<V> {
    self.get(key).cloned()
  }
}

impl<K, V> Field<K> for BTreeMap<K, V>
where
  K: Ord,
  V: Payload,
{
  type Output = V;

  fn field(&self, key: &K) -> Option<V> {
    self.get(key).cloned()
  }
}

impl<V> Field<usize> for Vec<V>
where
  V: Payload,
{
  type Output = V;

  fn field(&self, key: &usize) -> Option<V> {
    self.get(*key).cloned()
  }
}

/// The `key` field of every value. A value without it produces an error
/// signal instead.
pub fn pluck<T, K>(source: &Event<T>, key: K) -> Event<T::Output>
where
  T: Payload + Field<K>,
  K: Debug + Send + Sync + 'static,
{
  derive(source, "pluck", move |node: &Event<T::Output>, value: T| {
    match value.field(&key) {
      Some(field) => node.emit(field),
      None => node.emit_error(EventError::listener(
        node.name(),
        format!("missing key {:?}", key),
      )),
    }
  })
}

pub fn enumerate<T>(source: &Event<T>, start: usize) -> Event<(usize, T)>
where
  T: Payload,
{
  let index = AtomicUsize::new(start);
  derive(source, "enumerate", move |node, value| {
    node.emit((index.fetch_add(1, Ordering::AcqRel), value))
  })
}

/// Pairs every value with the scheduler time it arrived at.
pub fn timestamp<T>(source: &Event<T>) -> Event<(Duration, T)>
where
  T: Payload,
{
  let clock = source.scheduler();
  derive(source, "timestamp", move |node, value| {
    node.emit((clock.now(), value))
  })
}

pub fn constant<T, B>(source: &Event<T>, constant: B) -> Event<B>
where
  T: Payload,
  B: Payload,
{
  derive(source, "constant", move |node, _| node.emit(constant.clone()))
}

/// Emits `(previous, current)` for every value but the first.
pub fn pairwise<T>(source: &Event<T>) -> Event<(T, T)>
where
  T: Payload,
{
  let previous: Mutex<Option<T>> = Mutex::new(None);
  derive(source, "pairwise", move |node, value: T| {
    let previous = previous
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(value.clone());
    if let Some(previous) = previous {
      node.emit((previous, value));
    }
  })
}

/// Emits every value `count` values later, so the last `count` values are
/// never emitted.
pub fn previous<T>(source: &Event<T>, count: usize) -> Event<T>
where
  T: Payload,
{
  let held: Mutex<VecDeque<T>> = Mutex::new(VecDeque::new());
  derive(source, "previous", move |node, value| {
    let due = {
      let mut held = held.lock().unwrap_or_else(PoisonError::into_inner);
      held.push_back(value);
      if held.len() > count {
        held.pop_front()
      } else {
        None
      }
    };
    if let Some(due) = due {
      node.emit(due);
    }
  })
}

/// Groups values into vectors of `size`, a shorter remainder is emitted when
/// upstream ends.
pub fn chunk<T>(source: &Event<T>, size: usize) -> Result<Event<Vec<T>>>
where
  T: Payload,
{
  if size == 0 {
    return Err(EventError::construction("chunk size must not be zero"));
  }
  let node = source.derive("chunk");
  let pending: Arc<Mutex<Vec<T>>> = Default::default();
  let (fill, flush) = (pending.clone(), pending);
  follow_with(
    source,
    &node,
    move |node, value| {
      let full = {
        let mut pending = fill.lock().unwrap_or_else(PoisonError::into_inner);
        pending.push(value);
        if pending.len() == size {
          Some(std::mem::take(&mut *pending))
        } else {
          None
        }
      };
      if let Some(full) = full {
        node.emit(full);
      }
    },
    |node, error| node.emit_error(error),
    move |node| {
      let rest = std::mem::take(&mut *flush.lock().unwrap_or_else(PoisonError::into_inner));
      if !rest.is_empty() {
        node.emit(rest);
      }
      node.set_done();
    },
  );
  Ok(node)
}

/// Calls `func` for every value and forwards the value unchanged.
pub fn tap<T, F>(source: &Event<T>, func: F) -> Event<T>
where
  T: Payload,
  F: Fn(&T) + Send + Sync + 'static,
{
  derive(source, "tap", move |node, value| {
    func(&value);
    node.emit(value)
  })
}

struct Resequencer<B> {
  submitted: usize,
  emitted: usize,
  ready: BTreeMap<usize, Result<B>>,
  jobs: HashMap<usize, Arc<Job<Result<B>>>>,
  upstream_done: bool,
}

impl<B> Resequencer<B> {
  /// Results which are next in upstream order.
  fn drain(&mut self) -> Vec<Result<B>> {
    let mut results = Vec::new();
    while let Some(result) = self.ready.remove(&self.emitted) {
      self.emitted += 1;
      results.push(result);
    }
    results
  }

  fn finished(&self) -> bool {
    self.upstream_done && self.emitted == self.submitted
  }
}

fn lock<B>(state: &Mutex<Resequencer<B>>) -> MutexGuard<'_, Resequencer<B>> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn flush<B>(node: &Event<B>, state: &Mutex<Resequencer<B>>)
where
  B: Payload,
{
  let (results, finished) = {
    let mut state = lock(state);
    (state.drain(), state.finished())
  };
  for result in results {
    match result {
      Ok(value) => node.emit(value),
      Err(error) => node.emit_error(error),
    }
  }
  if finished {
    node.set_done();
  }
}

/// Hands every value to `submit` and emits the results in upstream order,
/// however the pending results complete. The returned futures are polled on
/// the event's scheduler and dropped when the event ends.
///
/// # Example
/// ```
/// use eventflow::EventBuilder;
/// use eventflow::event::ops::Transform;
/// use eventflow::event::scheduler::SchedulerType;
/// use eventflow::sync::executor::Executor;
/// use eventflow::sync::worker::WorkerPool;
///
/// let pool = WorkerPool::new(2);
/// let squares = EventBuilder::new()
///   .scheduler_type(SchedulerType::Virtual)
///   .sequence(vec![1, 2, 3, 4])
///   .execute(move |x: i32| pool.execute(move || x * x));
/// assert_eq!(squares.run().unwrap(), [1, 4, 9, 16]);
/// ```
pub fn execute<T, B, S, F>(source: &Event<T>, submit: S) -> Event<B>
where
  T: Payload,
  B: Payload,
  S: Fn(T) -> F + Send + Sync + 'static,
  F: Future<Output = Result<B>> + Send + 'static,
{
  let node = source.derive("execute");
  let state = Arc::new(Mutex::new(Resequencer {
    submitted: 0,
    emitted: 0,
    ready: BTreeMap::new(),
    jobs: HashMap::new(),
    upstream_done: false,
  }));
  let (submitted, ended, cancelled) = (state.clone(), state.clone(), state);
  follow_with(
    source,
    &node,
    move |node, value| {
      let pending = submit(value);
      let mut guard = lock(&submitted);
      let index = guard.submitted;
      guard.submitted += 1;
      drop(guard);
      let (target, results) = (node.clone(), submitted.clone());
      let job = Job::spawn(node.scheduler(), pending, move |result| {
        {
          let mut state = lock(&results);
          state.jobs.remove(&index);
          state.ready.insert(index, result);
        }
        flush(&target, &results);
      });
      let mut guard = lock(&submitted);
      if !job.is_complete() {
        guard.jobs.insert(index, job);
      }
    },
    |node, error| node.emit_error(error),
    move |node| {
      lock(&ended).upstream_done = true;
      flush(node, &ended);
    },
  );
  node.on_teardown(move || {
    let jobs: Vec<_> = lock(&cancelled).jobs.drain().map(|(_, job)| job).collect();
    for job in jobs {
      job.cancel();
    }
  });
  node
}

/// Value transformation operators.
///
/// # Example
/// ```
/// use eventflow::EventBuilder;
/// use eventflow::event::ops::Transform;
/// use eventflow::event::scheduler::SchedulerType;
///
/// let source = EventBuilder::new()
///   .scheduler_type(SchedulerType::Virtual)
///   .sequence(vec![3, 4, 5]);
/// let pairs = source.enumerate(0).starmap(|i: usize, x: i32| i as i32 * x);
/// assert_eq!(pairs.run().unwrap(), [0, 4, 10]);
/// ```
pub trait Transform<T>
where
  T: Payload,
{
  fn map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> B + Send + Sync + 'static;

  fn try_map<B, E, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    E: Display,
    F: Fn(T) -> std::result::Result<B, E> + Send + Sync + 'static;

  fn starmap<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Starred<T, B>;

  fn pluck<K>(&self, key: K) -> Event<T::Output>
  where
    T: Field<K>,
    K: Debug + Send + Sync + 'static;

  fn enumerate(&self, start: usize) -> Event<(usize, T)>;

  fn timestamp(&self) -> Event<(Duration, T)>;

  fn constant<B>(&self, constant: B) -> Event<B>
  where
    B: Payload;

  fn pairwise(&self) -> Event<(T, T)>;

  fn previous(&self, count: usize) -> Event<T>;

  fn chunk(&self, size: usize) -> Result<Event<Vec<T>>>;

  fn tap<F>(&self, func: F) -> Event<T>
  where
    F: Fn(&T) + Send + Sync + 'static;

  fn execute<B, S, F>(&self, submit: S) -> Event<B>
  where
    B: Payload,
    S: Fn(T) -> F + Send + Sync + 'static,
    F: Future<Output = Result<B>> + Send + 'static;
}

impl<T> Transform<T> for Event<T>
where
  T: Payload,
{
  fn map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> B + Send + Sync + 'static,
  {
    map(self, func)
  }

  fn try_map<B, E, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    E: Display,
    F: Fn(T) -> std::result::Result<B, E> + Send + Sync + 'static,
  {
    try_map(self, func)
  }

  fn starmap<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Starred<T, B>,
  {
    starmap(self, func)
  }

  fn pluck<K>(&self, key: K) -> Event<T::Output>
  where
    T: Field<K>,
    K: Debug + Send + Sync + 'static,
  {
    pluck(self, key)
  }

  fn enumerate(&self, start: usize) -> Event<(usize, T)> {
    enumerate(self, start)
  }

  fn timestamp(&self) -> Event<(Duration, T)> {
    timestamp(self)
  }

  fn constant<B>(&self, constant: B) -> Event<B>
  where
    B: Payload,
  {
    self::constant(self, constant)
  }

  fn pairwise(&self) -> Event<(T, T)> {
    pairwise(self)
  }

  fn previous(&self, count: usize) -> Event<T> {
    previous(self, count)
  }

  fn chunk(&self, size: usize) -> Result<Event<Vec<T>>> {
    chunk(self, size)
  }

  fn tap<F>(&self, func: F) -> Event<T>
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    tap(self, func)
  }

  fn execute<B, S, F>(&self, submit: S) -> Event<B>
  where
    B: Payload,
    S: Fn(T) -> F + Send + Sync + 'static,
    F: Future<Output = Result<B>> + Send + 'static,
  {
    execute(self, submit)
  }
}
