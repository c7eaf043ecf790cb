//! Source events.
//!
//! Sources are built from an [EventBuilder] and always emit through its
//! scheduler, one scheduled task per item, so a whole graph can be connected
//! before the first value flows. With the default zero interval every item is
//! due immediately. A source ends by itself once the last listener it ever had
//! leaves.
use crate::error::{EventError, Result};
use crate::event::observable::{Event, EventBuilder, Payload};
use crate::sync::task::Job;

use futures::{Stream, StreamExt};
use log::warn;

use std::convert::TryFrom;
use std::future::Future;
use std::iter;
use std::ops::Add;
use std::time::Duration;

/// What a producer hands to the driver: a value, an error, or `None` once it
/// is exhausted.
pub type Produced<T> = Option<Result<T>>;

fn pump<T, P>(event: Event<T>, interval: Duration, mut producer: P, current: Produced<T>)
where
  T: Payload,
  P: FnMut() -> Produced<T> + Send + 'static,
{
  if event.is_done() {
    return;
  }
  match current {
    Some(Ok(value)) => event.emit(value),
    Some(Err(error)) => event.emit_error(error),
    None => {
      event.set_done();
      return;
    }
  }
  let upcoming = producer();
  if upcoming.is_none() {
    event.set_done();
    return;
  }
  if event.is_done() {
    return;
  }
  let scheduler = event.scheduler();
  scheduler.call_later(interval, move || pump(event, interval, producer, upcoming));
}

/// The first point of `start`, `start + step`, ... which is not before `now`.
fn first_due(start: Duration, step: Duration, now: Duration) -> Option<Duration> {
  if start >= now {
    return Some(start);
  }
  let step = step.as_nanos();
  let steps = ((now - start).as_nanos() + step - 1) / step;
  let skipped = u64::try_from(steps.checked_mul(step)?).ok()?;
  start.checked_add(Duration::from_nanos(skipped))
}

/// Schedules `producer` to feed `event`, the first item after `delay`, every
/// following item `interval` after the previous one. Ends `event` right after
/// the last item.
fn drive<T, P>(event: &Event<T>, delay: Duration, interval: Duration, mut producer: P)
where
  T: Payload,
  P: FnMut() -> Produced<T> + Send + 'static,
{
  let target = event.clone();
  event.scheduler().call_later(delay, move || {
    let first = producer();
    pump(target, interval, producer, first);
  });
}

impl EventBuilder {
  fn iterate<T, I>(self, kind: &str, items: I) -> Event<T>
  where
    T: Payload,
    I: Iterator<Item = T> + Send + 'static,
  {
    let (event, interval) = self.source(kind);
    let mut items = items;
    drive(&event, Duration::from_secs(0), interval, move || {
      items.next().map(Ok)
    });
    event
  }

  /// Emits every item in order, then ends.
  ///
  /// # Example
  /// ```
  /// use eventflow::EventBuilder;
  /// use eventflow::event::scheduler::SchedulerType;
  ///
  /// let event = EventBuilder::new()
  ///   .scheduler_type(SchedulerType::Virtual)
  ///   .sequence(vec!["a", "b"]);
  /// assert_eq!(event.run().unwrap(), ["a", "b"]);
  /// ```
  pub fn sequence<T, I>(self, items: I) -> Event<T>
  where
    T: Payload,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
  {
    self.iterate("sequence", items.into_iter())
  }

  /// Emits `start`, `start + step`, ... up to but excluding `stop`. A
  /// negative step counts down.
  pub fn range<T>(self, start: T, stop: T, step: T) -> Result<Event<T>>
  where
    T: Payload + Copy + PartialOrd + Add<Output = T> + Default,
  {
    let zero = T::default();
    if !(step > zero || step < zero) {
      return Err(EventError::construction(format!(
        "range step must not be zero, got {:?}",
        step
      )));
    }
    let ascending = step > zero;
    let mut next = start;
    let items = iter::from_fn(move || {
      let inside = if ascending { next < stop } else { next > stop };
      if inside {
        let current = next;
        next = next + step;
        Some(current)
      } else {
        None
      }
    });
    Ok(self.iterate("range", items))
  }

  pub fn repeat<T>(self, value: T, count: usize) -> Event<T>
  where
    T: Payload,
  {
    self.iterate("repeat", iter::repeat(value).take(count))
  }

  /// Emits the elapsed time every `interval`, `count` times or forever.
  pub fn timer(self, interval: Duration, count: Option<usize>) -> Result<Event<Duration>> {
    if interval == Duration::from_secs(0) {
      return Err(EventError::construction("timer interval must not be zero"));
    }
    let (event, _) = self.source("timer");
    let mut fired: usize = 0;
    let mut elapsed = Duration::from_secs(0);
    drive(&event, interval, interval, move || {
      if count.map_or(false, |count| fired >= count) {
        return None;
      }
      fired += 1;
      elapsed = match elapsed.checked_add(interval) {
        Some(elapsed) => elapsed,
        None => {
          warn!("timer stopped, elapsed time no longer fits a duration");
          return None;
        }
      };
      Some(Ok(elapsed))
    });
    Ok(event)
  }

  /// Emits the points `start`, `start + step`, ... of the scheduler clock at
  /// those times, up to and including `end`. Points already past are
  /// skipped.
  pub fn timerange(
    self,
    start: Duration,
    end: Option<Duration>,
    step: Duration,
  ) -> Result<Event<Duration>> {
    if step == Duration::from_secs(0) {
      return Err(EventError::construction("timerange step must not be zero"));
    }
    let (event, _) = self.source("timerange");
    let now = event.scheduler().now();
    let first = match first_due(start, step, now) {
      Some(first) => first,
      None => {
        return Err(EventError::construction(format!(
          "timerange start {:?} is out of reach",
          start
        )))
      }
    };
    let mut next = Some(first);
    drive(&event, first - now, step, move || {
      let current = next.filter(|point| end.map_or(true, |end| *point <= end))?;
      next = current.checked_add(step);
      Some(Ok(current))
    });
    Ok(event)
  }

  /// Pull based source: `producer` is invoked once per tick until it returns
  /// `None`.
  pub fn generate<T, P>(self, producer: P) -> Event<T>
  where
    T: Payload,
    P: FnMut() -> Produced<T> + Send + 'static,
  {
    let (event, interval) = self.source("generate");
    drive(&event, Duration::from_secs(0), interval, producer);
    event
  }

  /// Emits the output of `future` then ends. The future is polled on the
  /// scheduler and dropped if the event ends first.
  pub fn wait<T, F>(self, future: F) -> Event<T>
  where
    T: Payload,
    F: Future<Output = T> + Send + 'static,
  {
    let (event, _) = self.source("wait");
    let target = event.clone();
    let job = Job::spawn(event.scheduler(), future, move |value| {
      target.emit(value);
      target.set_done();
    });
    event.on_teardown(move || job.cancel());
    event
  }

  /// Emits every item of `stream` then ends. The stream is polled on the
  /// scheduler and dropped if the event ends first.
  pub fn stream<T, S>(self, stream: S) -> Event<T>
  where
    T: Payload,
    S: Stream<Item = T> + Send + 'static,
  {
    self.poll_stream("stream", stream.map(Ok::<T, EventError>))
  }

  /// Like [stream](EventBuilder::stream), items which are errors are emitted
  /// as error signals and the stream keeps being polled.
  pub fn try_stream<T, S>(self, stream: S) -> Event<T>
  where
    T: Payload,
    S: Stream<Item = Result<T>> + Send + 'static,
  {
    self.poll_stream("try_stream", stream)
  }

  fn poll_stream<T, S>(self, kind: &str, stream: S) -> Event<T>
  where
    T: Payload,
    S: Stream<Item = Result<T>> + Send + 'static,
  {
    let (event, _) = self.source(kind);
    let target = event.clone();
    let mut stream = stream.boxed();
    let forward = async move {
      while let Some(item) = stream.next().await {
        if target.is_done() {
          return;
        }
        match item {
          Ok(value) => target.emit(value),
          Err(error) => target.emit_error(error),
        }
      }
      target.set_done();
    };
    let job = Job::spawn(event.scheduler(), forward, |()| {});
    event.on_teardown(move || job.cancel());
    event
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::scheduler::{Scheduler, VirtualScheduler};
  use crate::event::signal::Signal;
  use crate::utils::testing::Recorder;
  use futures::channel::oneshot;
  use std::sync::Arc;

  fn builder(scheduler: &Arc<VirtualScheduler>) -> EventBuilder {
    EventBuilder::new().scheduler(scheduler.clone())
  }

  #[test]
  fn sequence_interval_test() {
    let scheduler = VirtualScheduler::new();
    let event = builder(&scheduler)
      .interval(Duration::from_secs(2))
      .sequence(vec![1, 2, 3]);
    let recorder = Recorder::attach(&event);
    assert!(recorder.signals().is_empty());
    scheduler.run();
    let secs = Duration::from_secs;
    assert_eq!(
      recorder.timeline(),
      [
        (secs(0), Signal::Value(1)),
        (secs(2), Signal::Value(2)),
        (secs(4), Signal::Value(3)),
        (secs(4), Signal::Done),
      ]
    );
  }

  #[test]
  fn range_test() {
    let scheduler = VirtualScheduler::new();
    let up = builder(&scheduler).range(0, 10, 3).unwrap();
    let down = builder(&scheduler).range(3.0, 0.0, -1.5).unwrap();
    let up = Recorder::attach(&up);
    let down = Recorder::attach(&down);
    scheduler.run();
    assert_eq!(up.values(), [0, 3, 6, 9]);
    assert_eq!(down.values(), [3.0, 1.5]);
    assert!(builder(&scheduler).range(0, 10, 0).is_err());
  }

  #[test]
  fn empty_sequence_test() {
    let scheduler = VirtualScheduler::new();
    let event = builder(&scheduler).sequence(Vec::<i32>::new());
    let recorder = Recorder::attach(&event);
    scheduler.run();
    assert_eq!(recorder.signals(), [Signal::Done]);
  }

  #[test]
  fn repeat_test() {
    let scheduler = VirtualScheduler::new();
    let event = builder(&scheduler).repeat("x", 3);
    let recorder = Recorder::attach(&event);
    scheduler.run();
    assert_eq!(recorder.values(), ["x", "x", "x"]);
    assert!(recorder.is_done());
  }

  #[test]
  fn timer_test() {
    let scheduler = VirtualScheduler::new();
    let event = builder(&scheduler)
      .timer(Duration::from_millis(500), Some(3))
      .unwrap();
    let recorder = Recorder::attach(&event);
    scheduler.run();
    let ms = Duration::from_millis;
    assert_eq!(
      recorder.timeline(),
      [
        (ms(500), Signal::Value(ms(500))),
        (ms(1000), Signal::Value(ms(1000))),
        (ms(1500), Signal::Value(ms(1500))),
        (ms(1500), Signal::Done),
      ]
    );
    assert!(builder(&scheduler).timer(ms(0), None).is_err());
  }

  #[test]
  fn timer_stops_before_elapsed_overflow_test() {
    let scheduler = VirtualScheduler::new();
    let interval = Duration::MAX / 2 + Duration::from_secs(1);
    let event = builder(&scheduler).timer(interval, None).unwrap();
    let recorder = Recorder::attach(&event);
    scheduler.run();
    assert_eq!(
      recorder.timeline(),
      [(interval, Signal::Value(interval)), (interval, Signal::Done)]
    );
  }

  #[test]
  fn infinite_timer_ends_without_listeners_test() {
    let scheduler = VirtualScheduler::new();
    let event = builder(&scheduler)
      .timer(Duration::from_secs(1), None)
      .unwrap();
    let recorder = Recorder::attach(&event);
    scheduler.advance(Duration::from_millis(3500));
    assert_eq!(recorder.values().len(), 3);
    recorder.detach();
    scheduler.run();
    assert!(event.is_done());
    assert_eq!(scheduler.pending(), 0);
  }

  #[test]
  fn generate_test() {
    let scheduler = VirtualScheduler::new();
    let mut state = 0;
    let event = builder(&scheduler).generate(move || {
      state += 1;
      match state {
        1 | 3 => Some(Ok(state)),
        2 => Some(Err(EventError::custom("two"))),
        _ => None,
      }
    });
    let recorder = Recorder::attach(&event);
    scheduler.run();
    assert_eq!(
      recorder.signals(),
      [
        Signal::Value(1),
        Signal::Error(EventError::custom("two")),
        Signal::Value(3),
        Signal::Done,
      ]
    );
  }

  #[test]
  fn wait_test() {
    let scheduler = VirtualScheduler::new();
    let (tx, rx) = oneshot::channel();
    let event = builder(&scheduler).wait(async move { rx.await.unwrap_or(-1) });
    let recorder = Recorder::attach(&event);
    scheduler.run();
    assert!(recorder.signals().is_empty());
    tx.send(5).unwrap();
    scheduler.run();
    assert_eq!(recorder.signals(), [Signal::Value(5), Signal::Done]);
  }

  #[test]
  fn timerange_skips_past_points_test() {
    let scheduler = VirtualScheduler::new();
    scheduler.advance(Duration::from_secs(5));
    let secs = Duration::from_secs;
    let event = builder(&scheduler)
      .timerange(secs(2), Some(secs(11)), secs(3))
      .unwrap();
    let recorder = Recorder::attach(&event);
    scheduler.run();
    assert_eq!(
      recorder.timeline(),
      [
        (secs(5), Signal::Value(secs(5))),
        (secs(8), Signal::Value(secs(8))),
        (secs(11), Signal::Value(secs(11))),
        (secs(11), Signal::Done),
      ]
    );
    assert!(builder(&scheduler)
      .timerange(secs(0), None, secs(0))
      .is_err());
  }

  #[test]
  fn stream_test() {
    let scheduler = VirtualScheduler::new();
    let event = builder(&scheduler).stream(futures::stream::iter(vec![1, 2, 3]));
    let recorder = Recorder::attach(&event);
    assert!(recorder.signals().is_empty());
    scheduler.run();
    assert_eq!(
      recorder.signals(),
      [
        Signal::Value(1),
        Signal::Value(2),
        Signal::Value(3),
        Signal::Done
      ]
    );
  }

  #[test]
  fn stream_follows_channel_test() {
    use futures::channel::mpsc;
    let scheduler = VirtualScheduler::new();
    let (tx, rx) = mpsc::unbounded();
    let event = builder(&scheduler).stream(rx);
    let recorder = Recorder::attach(&event);
    tx.unbounded_send(1).unwrap();
    scheduler.run();
    assert_eq!(recorder.values(), [1]);
    assert!(!recorder.is_done());
    tx.unbounded_send(2).unwrap();
    drop(tx);
    scheduler.run();
    assert_eq!(recorder.values(), [1, 2]);
    assert!(recorder.is_done());
  }

  #[test]
  fn try_stream_keeps_polling_after_error_test() {
    let scheduler = VirtualScheduler::new();
    let items = vec![Ok(1), Err(EventError::custom("bad")), Ok(2)];
    let event = builder(&scheduler).try_stream(futures::stream::iter(items));
    let recorder = Recorder::attach(&event);
    scheduler.run();
    assert_eq!(recorder.values(), [1, 2]);
    assert_eq!(recorder.errors(), [EventError::custom("bad")]);
    assert!(recorder.is_done());
  }

  #[test]
  fn stream_dropped_on_teardown_test() {
    use futures::channel::mpsc;
    let scheduler = VirtualScheduler::new();
    let (tx, rx) = mpsc::unbounded::<i32>();
    let event = builder(&scheduler).stream(rx);
    let recorder = Recorder::attach(&event);
    scheduler.run();
    recorder.detach();
    assert!(event.is_done());
    assert!(tx.is_closed());
  }
}
