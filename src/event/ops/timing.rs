//! Operators driven by the scheduler clock.
//!
//! Each operator owns at most one pending timer, cancelled when the operator
//! ends or is dropped. Timers are tagged with a generation so a timer which
//! fires after being replaced is ignored.
use super::{derive, follow_with};
use crate::error::EventError;
use crate::event::observable::{Event, Payload};
use crate::event::scheduler::TimerHandle;
use crate::event::signal::Signal;

use log::trace;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancels whatever timer `state` holds once `node` ends.
fn cancel_on_teardown<B, S, F>(node: &Event<B>, state: &Arc<Mutex<S>>, timer: F)
where
  B: Payload,
  S: Send + 'static,
  F: Fn(&mut S) -> Option<TimerHandle> + Send + 'static,
{
  let state = state.clone();
  node.on_teardown(move || {
    let handle = timer(&mut lock(&state));
    if let Some(handle) = handle {
      handle.cancel();
    }
  });
}

fn deliver<T: Payload>(node: &Event<T>, signal: Signal<T>) {
  match signal {
    Signal::Value(value) => node.emit(value),
    Signal::Error(error) => node.emit_error(error),
    Signal::Done => node.set_done(),
  }
}

struct Delayed<T> {
  queue: VecDeque<(Duration, Signal<T>)>,
  timer: Option<TimerHandle>,
}

fn arm_delay<T: Payload>(node: &Event<T>, state: &Arc<Mutex<Delayed<T>>>) {
  if node.is_done() {
    return;
  }
  let mut delayed = lock(state);
  if delayed.timer.is_some() {
    return;
  }
  if let Some((deadline, _)) = delayed.queue.front() {
    let scheduler = node.scheduler();
    let wait = deadline.saturating_sub(scheduler.now());
    let (target, shared) = (node.clone(), state.clone());
    delayed.timer = Some(scheduler.call_later(wait, move || release(&target, &shared)));
  }
}

fn release<T: Payload>(node: &Event<T>, state: &Arc<Mutex<Delayed<T>>>) {
  let due = {
    let mut delayed = lock(state);
    delayed.timer = None;
    let now = node.scheduler().now();
    let mut due = Vec::new();
    while delayed.queue.front().map_or(false, |(deadline, _)| *deadline <= now) {
      if let Some((_, signal)) = delayed.queue.pop_front() {
        due.push(signal);
      }
    }
    due
  };
  for signal in due {
    deliver(node, signal);
  }
  arm_delay(node, state);
}

/// Re-emits every signal `delay` after it arrived, in arrival order. Done is
/// delayed as well.
pub fn delay<T>(source: &Event<T>, delay: Duration) -> Event<T>
where
  T: Payload,
{
  let node = source.derive("delay");
  let state = Arc::new(Mutex::new(Delayed {
    queue: VecDeque::new(),
    timer: None,
  }));
  let push = move |node: &Event<T>, state: &Arc<Mutex<Delayed<T>>>, signal: Signal<T>| {
    let deadline = node.scheduler().now() + delay;
    lock(state).queue.push_back((deadline, signal));
    arm_delay(node, state);
  };
  let (values, errors, dones) = (state.clone(), state.clone(), state.clone());
  follow_with(
    source,
    &node,
    move |node, value| push(node, &values, Signal::Value(value)),
    move |node, error| push(node, &errors, Signal::Error(error)),
    move |node| push(node, &dones, Signal::Done),
  );
  cancel_on_teardown(&node, &state, |delayed| delayed.timer.take());
  node
}

/// Forwards a value, then drops every value arriving within `window` of it.
/// The first value after the window opens a new one.
pub fn throttle<T>(source: &Event<T>, window: Duration) -> Event<T>
where
  T: Payload,
{
  let clock = source.scheduler();
  let open_at: Mutex<Option<Duration>> = Mutex::new(None);
  derive(source, "throttle", move |node, value| {
    let now = clock.now();
    let pass = {
      let mut open_at = lock(&open_at);
      if open_at.map_or(true, |open_at| now >= open_at) {
        *open_at = Some(now + window);
        true
      } else {
        false
      }
    };
    if pass {
      node.emit(value);
    } else {
      trace!("`{}` dropped {:?}", node.name(), value);
    }
  })
}

/// Leading edge debounce: forwards a value only if no other value arrived
/// within `quiet` before it. Dropped values still restart the wait.
pub fn debounce_first<T>(source: &Event<T>, quiet: Duration) -> Event<T>
where
  T: Payload,
{
  let clock = source.scheduler();
  let last: Mutex<Option<Duration>> = Mutex::new(None);
  derive(source, "debounce_first", move |node, value| {
    let now = clock.now();
    let previous = lock(&last).replace(now);
    if previous.map_or(true, |previous| now >= previous.saturating_add(quiet)) {
      node.emit(value);
    } else {
      trace!("`{}` dropped {:?}", node.name(), value);
    }
  })
}

struct Debounced<T> {
  pending: Option<T>,
  timer: Option<TimerHandle>,
  generation: u64,
  ended: bool,
}

fn settle<T: Payload>(node: &Event<T>, state: &Mutex<Debounced<T>>, generation: u64) {
  let (value, ended) = {
    let mut debounced = lock(state);
    if debounced.generation != generation {
      return;
    }
    debounced.timer = None;
    (debounced.pending.take(), debounced.ended)
  };
  if let Some(value) = value {
    node.emit(value);
  }
  if ended {
    node.set_done();
  }
}

/// Emits a value once no newer value arrived for `quiet`. Each value
/// restarts the wait. When upstream ends with a value still waiting, the
/// value is emitted first and done follows it.
pub fn debounce<T>(source: &Event<T>, quiet: Duration) -> Event<T>
where
  T: Payload,
{
  let node = source.derive("debounce");
  let state = Arc::new(Mutex::new(Debounced {
    pending: None,
    timer: None,
    generation: 0,
    ended: false,
  }));
  let (values, dones) = (state.clone(), state.clone());
  follow_with(
    source,
    &node,
    move |node, value| {
      let scheduler = node.scheduler();
      let mut debounced = lock(&values);
      if let Some(timer) = debounced.timer.take() {
        timer.cancel();
      }
      debounced.generation += 1;
      debounced.pending = Some(value);
      let (target, shared, generation) = (node.clone(), values.clone(), debounced.generation);
      debounced.timer = Some(scheduler.call_later(quiet, move || {
        settle(&target, &shared, generation)
      }));
    },
    |node, error| node.emit_error(error),
    move |node| {
      let waiting = {
        let mut debounced = lock(&dones);
        debounced.ended = true;
        debounced.pending.is_some()
      };
      if !waiting {
        node.set_done();
      }
    },
  );
  cancel_on_teardown(&node, &state, |debounced| debounced.timer.take());
  node
}

struct Watch {
  timer: Option<TimerHandle>,
  generation: u64,
}

fn rearm<T: Payload>(node: &Event<T>, state: &Arc<Mutex<Watch>>, window: Duration) {
  let scheduler = node.scheduler();
  let mut watch = lock(state);
  if let Some(timer) = watch.timer.take() {
    timer.cancel();
  }
  watch.generation += 1;
  let (target, shared, generation) = (node.clone(), state.clone(), watch.generation);
  watch.timer = Some(scheduler.call_later(window, move || {
    let current = {
      let mut watch = lock(&shared);
      if watch.generation == generation {
        watch.timer = None;
      }
      watch.generation == generation
    };
    if current {
      target.emit_error(EventError::Timeout {
        event: target.name().to_owned(),
        after: window,
      });
      target.set_done();
    }
  }));
}

/// Forwards values and fails with a [Timeout](EventError::Timeout) error,
/// then ends, when no value arrives within `window` of the previous one, or
/// of the creation of the operator for the first value.
pub fn timeout<T>(source: &Event<T>, window: Duration) -> Event<T>
where
  T: Payload,
{
  let node = source.derive("timeout");
  let state = Arc::new(Mutex::new(Watch {
    timer: None,
    generation: 0,
  }));
  let (values, dones) = (state.clone(), state.clone());
  follow_with(
    source,
    &node,
    move |node, value| {
      rearm(node, &values, window);
      node.emit(value);
    },
    |node, error| node.emit_error(error),
    move |node| {
      let timer = lock(&dones).timer.take();
      if let Some(timer) = timer {
        timer.cancel();
      }
      node.set_done();
    },
  );
  if !node.is_done() {
    rearm(&node, &state, window);
  }
  cancel_on_teardown(&node, &state, |watch| watch.timer.take());
  node
}

/// Emits the latest value of `source` each time `trigger` emits, if `source`
/// emitted since the previous sample. Ends with either of them.
pub fn sample<T, U>(source: &Event<T>, trigger: &Event<U>) -> Event<T>
where
  T: Payload,
  U: Payload,
{
  let node = source.derive("sample");
  let latest: Arc<Mutex<Option<T>>> = Default::default();
  let (store, take) = (latest.clone(), latest);
  follow_with(
    source,
    &node,
    move |_, value| *lock(&store) = Some(value),
    |node, error| node.emit_error(error),
    |node| node.set_done(),
  );
  follow_with(
    trigger,
    &node,
    move |node, _| {
      let value = lock(&take).take();
      if let Some(value) = value {
        node.emit(value);
      }
    },
    |node, error| node.emit_error(error),
    |node| node.set_done(),
  );
  node
}

/// # Example
/// ```
/// use eventflow::EventBuilder;
/// use eventflow::event::ops::Timing;
/// use eventflow::event::scheduler::{Scheduler, VirtualScheduler};
/// use std::time::Duration;
///
/// let scheduler = VirtualScheduler::new();
/// let source = EventBuilder::new()
///   .scheduler(scheduler.clone())
///   .interval(Duration::from_secs(1))
///   .sequence(vec![1, 2, 3]);
/// let delayed = source.delay(Duration::from_secs(10));
/// assert_eq!(delayed.run().unwrap(), [1, 2, 3]);
/// assert_eq!(scheduler.now(), Duration::from_secs(12));
/// ```
pub trait Timing<T>
where
  T: Payload,
{
  fn delay(&self, delay: Duration) -> Event<T>;

  fn throttle(&self, window: Duration) -> Event<T>;

  fn debounce(&self, quiet: Duration) -> Event<T>;

  fn debounce_first(&self, quiet: Duration) -> Event<T>;

  fn timeout(&self, window: Duration) -> Event<T>;

  fn sample<U>(&self, trigger: &Event<U>) -> Event<T>
  where
    U: Payload;
}

impl<T> Timing<T> for Event<T>
where
  T: Payload,
{
  fn delay(&self, delay: Duration) -> Event<T> {
    self::delay(self, delay)
  }

  fn throttle(&self, window: Duration) -> Event<T> {
    throttle(self, window)
  }

  fn debounce(&self, quiet: Duration) -> Event<T> {
    debounce(self, quiet)
  }

  fn debounce_first(&self, quiet: Duration) -> Event<T> {
    debounce_first(self, quiet)
  }

  fn timeout(&self, window: Duration) -> Event<T> {
    timeout(self, window)
  }

  fn sample<U>(&self, trigger: &Event<U>) -> Event<T>
  where
    U: Payload,
  {
    sample(self, trigger)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::scheduler::{Scheduler, Task, VirtualScheduler};
  use crate::utils::testing::Recorder;
  use crate::EventBuilder;

  fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
  }

  fn manual<T: Payload>(scheduler: &Arc<VirtualScheduler>) -> Event<T> {
    EventBuilder::new()
      .name("manual")
      .scheduler(scheduler.clone())
      .build()
  }

  /// Emits `values` at the given times, then ends at `end`.
  fn feed<T: Payload>(
    scheduler: &Arc<VirtualScheduler>,
    event: &Event<T>,
    values: Vec<(u64, T)>,
    end: u64,
  ) {
    for (at, value) in values {
      let target = event.clone();
      scheduler.after(secs(at), Task::new(move || target.emit(value)));
    }
    let target = event.clone();
    scheduler.after(secs(end), Task::new(move || target.set_done()));
  }

  #[test]
  fn delay_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let recorder = Recorder::attach(&source.delay(secs(3)));
    feed(&scheduler, &source, vec![(0, 1), (1, 2), (5, 3)], 6);
    scheduler.run();
    assert_eq!(
      recorder.timeline(),
      [
        (secs(3), Signal::Value(1)),
        (secs(4), Signal::Value(2)),
        (secs(8), Signal::Value(3)),
        (secs(9), Signal::Done),
      ]
    );
  }

  #[test]
  fn throttle_leading_edge_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let recorder = Recorder::attach(&source.throttle(secs(5)));
    feed(&scheduler, &source, vec![(0, 1), (1, 2), (2, 3), (6, 4), (8, 5)], 20);
    scheduler.run();
    assert_eq!(
      recorder.timeline(),
      [
        (secs(0), Signal::Value(1)),
        (secs(6), Signal::Value(4)),
        (secs(20), Signal::Done),
      ]
    );
  }

  #[test]
  fn debounce_trailing_edge_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let recorder = Recorder::attach(&source.debounce(secs(5)));
    feed(&scheduler, &source, vec![(0, 1), (1, 2), (2, 3), (10, 4)], 12);
    scheduler.run();
    assert_eq!(
      recorder.timeline(),
      [
        (secs(7), Signal::Value(3)),
        (secs(15), Signal::Value(4)),
        (secs(15), Signal::Done),
      ]
    );
    assert_eq!(scheduler.pending(), 0);
  }

  #[test]
  fn debounce_first_leading_edge_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let recorder = Recorder::attach(&source.debounce_first(secs(5)));
    feed(
      &scheduler,
      &source,
      vec![(0, 1), (3, 2), (7, 3), (13, 4), (18, 5)],
      20,
    );
    scheduler.run();
    assert_eq!(
      recorder.timeline(),
      [
        (secs(0), Signal::Value(1)),
        (secs(13), Signal::Value(4)),
        (secs(18), Signal::Value(5)),
        (secs(20), Signal::Done),
      ]
    );
  }

  #[test]
  fn timeout_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let guarded = source.timeout(secs(2));
    let recorder = Recorder::attach(&guarded);
    feed(&scheduler, &source, vec![(1, 1), (2, 2)], 100);
    scheduler.run();
    let timeline = recorder.timeline();
    assert_eq!(timeline.len(), 4);
    assert_eq!(timeline[1], (secs(2), Signal::Value(2)));
    assert_eq!(timeline[2].0, secs(4));
    match &timeline[2].1 {
      Signal::Error(error) => assert!(error.is_timeout()),
      other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(timeline[3], (secs(4), Signal::Done));
    assert!(source.is_empty());
  }

  #[test]
  fn timeout_quiet_source_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let recorder = Recorder::attach(&source.timeout(secs(1)));
    feed(&scheduler, &source, vec![(0, 1)], 1);
    scheduler.run();
    assert_eq!(recorder.signals(), [Signal::Value(1), Signal::Done]);
  }

  #[test]
  fn timer_cancelled_on_detach_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let debounced = source.debounce(secs(5));
    let recorder = Recorder::attach(&debounced);
    source.emit(1);
    assert_eq!(scheduler.pending(), 1);
    recorder.detach();
    assert!(debounced.is_done());
    assert_eq!(scheduler.pending(), 0);
    assert!(source.is_empty());
  }

  #[test]
  fn sample_test() {
    let scheduler = VirtualScheduler::new();
    let source = manual::<i32>(&scheduler);
    let trigger = manual::<()>(&scheduler);
    let recorder = Recorder::attach(&source.sample(&trigger));
    trigger.emit(());
    source.emit(1);
    source.emit(2);
    trigger.emit(());
    trigger.emit(());
    source.emit(3);
    trigger.emit(());
    trigger.set_done();
    assert_eq!(
      recorder.signals(),
      [Signal::Value(2), Signal::Value(3), Signal::Done]
    );
  }
}
