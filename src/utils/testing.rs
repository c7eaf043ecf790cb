use crate::error::EventError;
use crate::event::dispatcher::Connection;
use crate::event::observable::{Event, Payload};
use crate::event::signal::Signal;
use crate::event::subscription::Subscription;

use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::{thread, time::Duration};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn panic_after<T, F>(d: Duration, f: F) -> T
where
  T: Send + 'static,
  F: FnOnce() -> T + Send + 'static,
{
  let (done_tx, done_rx) = mpsc::channel();
  let handle = thread::Builder::new()
    .name("testing-thread".to_owned())
    .spawn(move || {
      let val = f();
      done_tx.send(()).expect("failed to send complete signal");
      val
    })
    .expect("failed to spawn testing thread");
  match done_rx.recv_timeout(d) {
    Ok(_) => handle.join().expect("thread panicked"),
    Err(error) => match error {
      mpsc::RecvTimeoutError::Timeout => panic!("thread took too long"),
      mpsc::RecvTimeoutError::Disconnected => panic!("thread panicked"),
    },
  }
}

/// Runs `f` on a watchdog thread, panicking if it takes longer than
/// [DEFAULT_TIMEOUT].
pub fn async_context<T, F>(f: F) -> T
where
  T: Send + 'static,
  F: FnOnce() -> T + Send + 'static,
{
  panic_after(DEFAULT_TIMEOUT, f)
}

type Timeline<T> = Arc<Mutex<Vec<(Duration, Signal<T>)>>>;

fn lock<T>(timeline: &Timeline<T>) -> MutexGuard<'_, Vec<(Duration, Signal<T>)>> {
  timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every signal of an event together with the scheduler time it was
/// received at.
///
/// # Example
/// ```
/// use eventflow::event::scheduler::VirtualScheduler;
/// use eventflow::utils::testing::Recorder;
/// use eventflow::{EventBuilder, Signal};
///
/// let scheduler = VirtualScheduler::new();
/// let event = EventBuilder::new().scheduler(scheduler.clone()).sequence(vec![1]);
/// let recorder = Recorder::attach(&event);
/// scheduler.run();
/// assert_eq!(recorder.signals(), [Signal::Value(1), Signal::Done]);
/// ```
pub struct Recorder<T>
where
  T: Payload,
{
  timeline: Timeline<T>,
  subscription: Subscription,
}

impl<T> Recorder<T>
where
  T: Payload,
{
  pub fn attach(event: &Event<T>) -> Self {
    let timeline: Timeline<T> = Arc::new(Mutex::new(Vec::new()));
    let (values, errors, done) = (timeline.clone(), timeline.clone(), timeline.clone());
    let (clock, error_clock, done_clock) = (
      event.scheduler(),
      event.scheduler(),
      event.scheduler(),
    );
    let connection = Connection::func(move |value: T| {
      lock(&values).push((clock.now(), Signal::Value(value)))
    })
    .on_error(move |error: &EventError| {
      lock(&errors).push((error_clock.now(), Signal::Error(error.clone())))
    })
    .on_done(move || lock(&done).push((done_clock.now(), Signal::Done)));
    Recorder {
      timeline,
      subscription: event.attach(connection, false),
    }
  }

  pub fn timeline(&self) -> Vec<(Duration, Signal<T>)> {
    lock(&self.timeline).clone()
  }

  pub fn signals(&self) -> Vec<Signal<T>> {
    lock(&self.timeline)
      .iter()
      .map(|(_, signal)| signal.clone())
      .collect()
  }

  pub fn values(&self) -> Vec<T> {
    self
      .signals()
      .into_iter()
      .filter_map(Signal::value)
      .collect()
  }

  pub fn errors(&self) -> Vec<EventError> {
    self
      .signals()
      .into_iter()
      .filter_map(|signal| match signal {
        Signal::Error(error) => Some(error),
        _ => None,
      })
      .collect()
  }

  pub fn is_done(&self) -> bool {
    lock(&self.timeline)
      .last()
      .map_or(false, |(_, signal)| signal.is_done())
  }

  /// Disconnects from the event, nothing is recorded afterwards.
  pub fn detach(&self) {
    self.subscription.disconnect();
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  #[should_panic]
  fn panic_after_timeout_test() {
    panic_after(Duration::from_secs(0), || {
      std::thread::sleep(Duration::from_secs(1));
    });
  }

  #[test]
  fn recorder_test() {
    let event = Event::new();
    let recorder = Recorder::attach(&event);
    event.emit(1);
    event.emit_error(EventError::custom("bad"));
    assert!(!recorder.is_done());
    event.set_done();
    assert_eq!(recorder.values(), [1]);
    assert_eq!(recorder.errors(), [EventError::custom("bad")]);
    assert!(recorder.is_done());
  }

  #[test]
  fn recorder_detach_test() {
    let event = Event::new();
    let recorder = Recorder::attach(&event);
    event.emit("a");
    recorder.detach();
    event.emit("b");
    assert_eq!(recorder.values(), ["a"]);
    assert!(event.is_empty());
  }
}
