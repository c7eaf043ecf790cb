//! Running aggregates. Every operator keeps a single accumulator and emits its
//! updated value for each upstream value, so they are safe to use on
//! unbounded streams.
use super::{derive, follow_with};
use crate::error::{EventError, Result};
use crate::event::observable::{Event, Payload};
use crate::utils::stats::Welford;

use std::collections::VecDeque;
use std::ops::{Add, Mul};
use std::sync::{Arc, Mutex, PoisonError};

/// Folds every value into the accumulator and emits the new accumulator.
pub fn reduce<T, A, F>(source: &Event<T>, seed: A, func: F) -> Event<A>
where
  T: Payload,
  A: Payload,
  F: Fn(A, T) -> A + Send + Sync + 'static,
{
  let accumulator = Mutex::new(seed);
  derive(source, "reduce", move |node, value| {
    let next = {
      let mut accumulator = accumulator.lock().unwrap_or_else(PoisonError::into_inner);
      let next = func(accumulator.clone(), value);
      *accumulator = next.clone();
      next
    };
    node.emit(next);
  })
}

pub fn count<T>(source: &Event<T>) -> Event<usize>
where
  T: Payload,
{
  reduce(source, 0, |count, _| count + 1)
}

pub fn sum<T>(source: &Event<T>) -> Event<T>
where
  T: Payload + Add<Output = T> + Default,
{
  reduce(source, T::default(), |total, x| total + x)
}

/// Running product, starting from `T::from(1)`.
pub fn product<T>(source: &Event<T>) -> Event<T>
where
  T: Payload + Mul<Output = T> + From<u8>,
{
  reduce(source, T::from(1), |total, x| total * x)
}

/// Running arithmetic mean, updated incrementally.
pub fn mean<T>(source: &Event<T>) -> Event<f64>
where
  T: Payload + Into<f64>,
{
  let running = Mutex::new(Welford::default());
  derive(source, "mean", move |node, value: T| {
    let mean = {
      let mut running = running.lock().unwrap_or_else(PoisonError::into_inner);
      running.push(value.into());
      running.mean()
    };
    node.emit(mean);
  })
}

fn extremum<T, F>(source: &Event<T>, operator: &str, replace: F) -> Event<T>
where
  T: Payload,
  F: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
  let best: Mutex<Option<T>> = Mutex::new(None);
  derive(source, operator, move |node, value| {
    let current = {
      let mut best = best.lock().unwrap_or_else(PoisonError::into_inner);
      let keep = match best.as_ref() {
        Some(best) => !replace(best, &value),
        None => false,
      };
      if !keep {
        *best = Some(value);
      }
      best.clone()
    };
    if let Some(current) = current {
      node.emit(current);
    }
  })
}

/// Running minimum. Values which do not compare, such as `NaN`, never
/// replace the current minimum.
pub fn min<T>(source: &Event<T>) -> Event<T>
where
  T: Payload + PartialOrd,
{
  extremum(source, "min", |best, value| value < best)
}

pub fn max<T>(source: &Event<T>) -> Event<T>
where
  T: Payload + PartialOrd,
{
  extremum(source, "max", |best, value| value > best)
}

fn decide<T, F>(source: &Event<T>, operator: &str, predicate: F, on_match: bool) -> Event<bool>
where
  T: Payload,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  let node = source.derive(operator);
  follow_with(
    source,
    &node,
    move |node, value| {
      if predicate(&value) == on_match {
        node.emit(on_match);
        node.set_done();
      }
    },
    |node, error| node.emit_error(error),
    move |node| {
      node.emit(!on_match);
      node.set_done();
    },
  );
  node
}

/// Emits `true` and ends on the first value satisfying `predicate`, or emits
/// `false` when upstream ends without one.
pub fn any<T, F>(source: &Event<T>, predicate: F) -> Event<bool>
where
  T: Payload,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  decide(source, "any", predicate, true)
}

/// Emits `false` and ends on the first value failing `predicate`, or emits
/// `true` when upstream ends.
pub fn all<T, F>(source: &Event<T>, predicate: F) -> Event<bool>
where
  T: Payload,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  decide(source, "all", predicate, false)
}

/// Exponential moving average, `weight` is the share of the newest value and
/// must lie in `(0, 1]`.
pub fn ema<T>(source: &Event<T>, weight: f64) -> Result<Event<f64>>
where
  T: Payload + Into<f64>,
{
  if !(weight > 0.0 && weight <= 1.0) {
    return Err(EventError::construction(format!(
      "ema weight must lie in (0, 1], got {}",
      weight
    )));
  }
  let average: Mutex<Option<f64>> = Mutex::new(None);
  Ok(derive(source, "ema", move |node, value: T| {
    let x = value.into();
    let next = {
      let mut average = average.lock().unwrap_or_else(PoisonError::into_inner);
      let next = match *average {
        Some(previous) => weight * x + (1.0 - weight) * previous,
        None => x,
      };
      *average = Some(next);
      next
    };
    node.emit(next);
  }))
}

/// Emits the last `count` values on every value, all values so far when
/// `count` is zero.
pub fn deque<T>(source: &Event<T>, count: usize) -> Event<VecDeque<T>>
where
  T: Payload,
{
  let recent: Mutex<VecDeque<T>> = Mutex::new(VecDeque::new());
  derive(source, "deque", move |node, value| {
    let snapshot = {
      let mut recent = recent.lock().unwrap_or_else(PoisonError::into_inner);
      recent.push_back(value);
      if count > 0 && recent.len() > count {
        recent.pop_front();
      }
      recent.clone()
    };
    node.emit(snapshot);
  })
}

/// Collects every value and emits them as one vector when upstream ends.
pub fn list<T>(source: &Event<T>) -> Event<Vec<T>>
where
  T: Payload,
{
  let node = source.derive("list");
  let collected: Arc<Mutex<Vec<T>>> = Default::default();
  let (fill, flush) = (collected.clone(), collected);
  follow_with(
    source,
    &node,
    move |_, value| fill.lock().unwrap_or_else(PoisonError::into_inner).push(value),
    |node, error| node.emit_error(error),
    move |node| {
      let values = std::mem::take(&mut *flush.lock().unwrap_or_else(PoisonError::into_inner));
      node.emit(values);
      node.set_done();
    },
  );
  node
}

/// # Example
/// ```
/// use eventflow::EventBuilder;
/// use eventflow::event::ops::Aggregate;
/// use eventflow::event::scheduler::SchedulerType;
///
/// let source = EventBuilder::new()
///   .scheduler_type(SchedulerType::Virtual)
///   .sequence(vec![2.0, 4.0, 9.0]);
/// assert_eq!(source.mean().run().unwrap(), [2.0, 3.0, 5.0]);
/// ```
pub trait Aggregate<T>
where
  T: Payload,
{
  fn reduce<A, F>(&self, seed: A, func: F) -> Event<A>
  where
    A: Payload,
    F: Fn(A, T) -> A + Send + Sync + 'static;

  fn count(&self) -> Event<usize>;

  fn sum(&self) -> Event<T>
  where
    T: Add<Output = T> + Default;

  fn product(&self) -> Event<T>
  where
    T: Mul<Output = T> + From<u8>;

  fn mean(&self) -> Event<f64>
  where
    T: Into<f64>;

  fn min(&self) -> Event<T>
  where
    T: PartialOrd;

  fn max(&self) -> Event<T>
  where
    T: PartialOrd;

  fn any<F>(&self, predicate: F) -> Event<bool>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static;

  fn all<F>(&self, predicate: F) -> Event<bool>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static;

  fn ema(&self, weight: f64) -> Result<Event<f64>>
  where
    T: Into<f64>;

  fn deque(&self, count: usize) -> Event<VecDeque<T>>;

  fn list(&self) -> Event<Vec<T>>;
}

impl<T> Aggregate<T> for Event<T>
where
  T: Payload,
{
  fn reduce<A, F>(&self, seed: A, func: F) -> Event<A>
  where
    A: Payload,
    F: Fn(A, T) -> A + Send + Sync + 'static,
  {
    reduce(self, seed, func)
  }

  fn count(&self) -> Event<usize> {
    count(self)
  }

  fn sum(&self) -> Event<T>
  where
    T: Add<Output = T> + Default,
  {
    sum(self)
  }

  fn product(&self) -> Event<T>
  where
    T: Mul<Output = T> + From<u8>,
  {
    product(self)
  }

  fn mean(&self) -> Event<f64>
  where
    T: Into<f64>,
  {
    mean(self)
  }

  fn min(&self) -> Event<T>
  where
    T: PartialOrd,
  {
    min(self)
  }

  fn max(&self) -> Event<T>
  where
    T: PartialOrd,
  {
    max(self)
  }

  fn any<F>(&self, predicate: F) -> Event<bool>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    any(self, predicate)
  }

  fn all<F>(&self, predicate: F) -> Event<bool>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    all(self, predicate)
  }

  fn ema(&self, weight: f64) -> Result<Event<f64>>
  where
    T: Into<f64>,
  {
    ema(self, weight)
  }

  fn deque(&self, count: usize) -> Event<VecDeque<T>> {
    deque(self, count)
  }

  fn list(&self) -> Event<Vec<T>> {
    list(self)
  }
}
