//! Asynchronous side of an event.
//!
//! An event hands values to at most one [Consumer] through an inbox whose
//! overflow behavior is chosen by a [Backpressure] policy. Consumers and
//! [NextSignal] futures drive the event's scheduler while they wait, so a
//! graph fed by scheduled sources makes progress from inside
//! `futures::executor::block_on`.
use super::dispatcher::Connection;
use super::observable::{Event, Payload};
use super::scheduler::Scheduler;
use super::signal::Signal;
use super::subscription::Subscription;
use crate::error::{EventError, Result};

use futures::Stream;
use log::debug;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};

/// Policy applied when values arrive faster than the consumer takes them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backpressure {
  Unbounded,
  /// Producers on other threads wait while `n` items are buffered. A
  /// producer running on the consumer's own thread is never blocked.
  Block(usize),
  /// At most `n` items are buffered, the oldest is discarded on overflow.
  DropOldest(usize),
  /// Only the most recent value and the most recent error are buffered,
  /// each in arrival order relative to the other.
  KeepLatest,
}

impl Backpressure {
  pub(crate) fn validate(self) -> Result<Self> {
    match self {
      Backpressure::Block(0) | Backpressure::DropOldest(0) => Err(
        EventError::construction(format!("{:?} needs a capacity above zero", self)),
      ),
      policy => Ok(policy),
    }
  }
}

impl Default for Backpressure {
  fn default() -> Self {
    Backpressure::Unbounded
  }
}

struct InboxState<T> {
  queue: VecDeque<Result<T, EventError>>,
  finished: bool,
  closed: bool,
  waker: Option<Waker>,
  driver: Option<ThreadId>,
}

pub(crate) struct Inbox<T> {
  state: Mutex<InboxState<T>>,
  space: Condvar,
  policy: Backpressure,
}

impl<T> Inbox<T> {
  pub(crate) fn new(policy: Backpressure) -> Arc<Self> {
    Arc::new(Inbox {
      state: Mutex::new(InboxState {
        queue: VecDeque::new(),
        finished: false,
        closed: false,
        waker: None,
        driver: None,
      }),
      space: Condvar::new(),
      policy,
    })
  }

  fn lock(&self) -> MutexGuard<'_, InboxState<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn push(&self, item: Result<T, EventError>) {
    let mut state = self.lock();
    if state.closed || state.finished {
      return;
    }
    match self.policy {
      Backpressure::Unbounded => {}
      Backpressure::Block(capacity) => {
        let current = thread::current().id();
        while state.queue.len() >= capacity && !state.closed && state.driver != Some(current) {
          state = self
            .space
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
          return;
        }
      }
      Backpressure::DropOldest(capacity) => {
        while state.queue.len() >= capacity {
          state.queue.pop_front();
        }
      }
      Backpressure::KeepLatest => {
        let incoming = item.is_ok();
        state.queue.retain(|queued| queued.is_ok() != incoming);
      }
    }
    state.queue.push_back(item);
    let waker = state.waker.take();
    drop(state);
    if let Some(waker) = waker {
      waker.wake();
    }
  }

  /// No more items will arrive, buffered items remain readable.
  pub(crate) fn finish(&self) {
    let waker = {
      let mut state = self.lock();
      state.finished = true;
      state.waker.take()
    };
    self.space.notify_all();
    if let Some(waker) = waker {
      waker.wake();
    }
  }

  /// The consumer is gone, buffered items are discarded and blocked
  /// producers released.
  pub(crate) fn close(&self) {
    {
      let mut state = self.lock();
      state.closed = true;
      state.queue.clear();
    }
    self.space.notify_all();
  }

  fn poll_item(&self, waker: &Waker) -> Poll<Option<Result<T, EventError>>> {
    let mut state = self.lock();
    if let Some(item) = state.queue.pop_front() {
      drop(state);
      self.space.notify_one();
      return Poll::Ready(Some(item));
    }
    if state.finished {
      return Poll::Ready(None);
    }
    state.waker = Some(waker.clone());
    Poll::Pending
  }

  fn set_driver(&self, driver: Option<ThreadId>) {
    self.lock().driver = driver;
  }

  pub(crate) fn len(&self) -> usize {
    self.lock().queue.len()
  }
}

/// Runs due timers on behalf of a waiting consumer. Returns `false` once
/// nothing is due and the waker has been parked on the scheduler, so a value
/// pushed from another thread is picked up without waiting for a deadline.
fn drive(scheduler: &Arc<dyn Scheduler>, waker: &Waker) -> bool {
  scheduler.step_due(waker)
}

/// Single consumer pull handle of an event, see
/// [Event::consume](super::observable::Event::consume).
///
/// Yields `Ok` for values and `Err` for error signals, and ends once the
/// event is done. Errors do not end the stream.
pub struct Consumer<T>
where
  T: Payload,
{
  event: Event<T>,
  inbox: Arc<Inbox<T>>,
}

impl<T> Consumer<T>
where
  T: Payload,
{
  pub(crate) fn new(event: Event<T>, inbox: Arc<Inbox<T>>) -> Self {
    Consumer { event, inbox }
  }

  pub fn event(&self) -> &Event<T> {
    &self.event
  }

  /// Number of items waiting to be taken.
  pub fn buffered(&self) -> usize {
    self.inbox.len()
  }
}

impl<T> Stream for Consumer<T>
where
  T: Payload,
{
  type Item = Result<T, EventError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let scheduler = self.event.scheduler();
    loop {
      if let Poll::Ready(item) = self.inbox.poll_item(cx.waker()) {
        return Poll::Ready(item);
      }
      self.inbox.set_driver(Some(thread::current().id()));
      let progressed = drive(&scheduler, cx.waker());
      self.inbox.set_driver(None);
      if !progressed {
        return Poll::Pending;
      }
    }
  }
}

impl<T> Drop for Consumer<T>
where
  T: Payload,
{
  fn drop(&mut self) {
    debug!("consumer detached from `{}`", self.event.name());
    self.inbox.close();
    self.event.release_consumer(&self.inbox);
  }
}

struct Pending<T> {
  signal: Option<Signal<T>>,
  waker: Option<Waker>,
}

fn resolve<T>(shared: &Mutex<Pending<T>>, signal: Signal<T>) {
  let waker = {
    let mut pending = shared.lock().unwrap_or_else(PoisonError::into_inner);
    if pending.signal.is_some() {
      return;
    }
    pending.signal = Some(signal);
    pending.waker.take()
  };
  if let Some(waker) = waker {
    waker.wake();
  }
}

/// Future of the next signal of an event, see
/// [Event::await_next](super::observable::Event::await_next).
///
/// Resolves with the first value or error emitted after its creation, or with
/// [Signal::Done] if the event ends first or has already ended.
pub struct NextSignal<T> {
  scheduler: Arc<dyn Scheduler>,
  shared: Arc<Mutex<Pending<T>>>,
  subscription: Option<Subscription>,
}

impl<T> NextSignal<T>
where
  T: Payload,
{
  pub(crate) fn new(event: &Event<T>) -> Self {
    let shared = Arc::new(Mutex::new(Pending {
      signal: None,
      waker: None,
    }));
    let values = shared.clone();
    let errors = shared.clone();
    let done = shared.clone();
    let connection = Connection::func(move |value: T| resolve(&values, Signal::Value(value)))
      .on_error(move |error| resolve(&errors, Signal::Error(error.clone())))
      .on_done(move || resolve(&done, Signal::Done));
    NextSignal {
      scheduler: event.scheduler(),
      shared,
      subscription: Some(event.attach(connection, true)),
    }
  }
}

impl<T> Future for NextSignal<T> {
  type Output = Signal<T>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Signal<T>> {
    let this = self.get_mut();
    loop {
      {
        let mut pending = this.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = pending.signal.take() {
          drop(pending);
          if let Some(subscription) = this.subscription.take() {
            subscription.disconnect();
          }
          return Poll::Ready(signal);
        }
        pending.waker = Some(cx.waker().clone());
      }
      if !drive(&this.scheduler, cx.waker()) {
        return Poll::Pending;
      }
    }
  }
}

impl<T> Drop for NextSignal<T> {
  fn drop(&mut self) {
    if let Some(subscription) = self.subscription.take() {
      subscription.disconnect();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use futures::task::noop_waker;

  #[test]
  fn validate_capacity_test() {
    assert!(Backpressure::Block(0).validate().is_err());
    assert!(Backpressure::DropOldest(0).validate().is_err());
    assert_eq!(
      Backpressure::DropOldest(2).validate(),
      Ok(Backpressure::DropOldest(2))
    );
  }

  fn drain(inbox: &Inbox<i32>) -> Vec<Result<i32, EventError>> {
    let waker = noop_waker();
    let mut items = Vec::new();
    while let Poll::Ready(Some(item)) = inbox.poll_item(&waker) {
      items.push(item);
    }
    items
  }

  #[test]
  fn drop_oldest_test() {
    let inbox = Inbox::new(Backpressure::DropOldest(2));
    for x in 1..=5 {
      inbox.push(Ok(x));
    }
    assert_eq!(drain(&inbox), [Ok(4), Ok(5)]);
  }

  #[test]
  fn keep_latest_test() {
    let inbox = Inbox::new(Backpressure::KeepLatest);
    inbox.push(Ok(1));
    inbox.push(Err(EventError::custom("bad")));
    inbox.push(Ok(2));
    inbox.push(Ok(3));
    assert_eq!(drain(&inbox), [Err(EventError::custom("bad")), Ok(3)]);
  }

  #[test]
  fn keep_latest_error_test() {
    let inbox = Inbox::new(Backpressure::KeepLatest);
    for x in 0..100 {
      inbox.push(Err(EventError::custom(x)));
    }
    inbox.push(Ok(1));
    assert_eq!(inbox.len(), 2);
    inbox.push(Err(EventError::custom("last")));
    assert_eq!(drain(&inbox), [Ok(1), Err(EventError::custom("last"))]);
  }

  #[test]
  fn finish_test() {
    let inbox = Inbox::new(Backpressure::Unbounded);
    inbox.push(Ok(1));
    inbox.finish();
    inbox.push(Ok(2));
    let waker = noop_waker();
    assert_eq!(inbox.poll_item(&waker), Poll::Ready(Some(Ok(1))));
    assert_eq!(inbox.poll_item(&waker), Poll::Ready(None));
  }

  #[test]
  fn block_same_thread_test() {
    let inbox = Inbox::new(Backpressure::Block(1));
    inbox.set_driver(Some(thread::current().id()));
    inbox.push(Ok(1));
    inbox.push(Ok(2));
    inbox.set_driver(None);
    assert_eq!(drain(&inbox), [Ok(1), Ok(2)]);
  }

  #[test]
  fn block_other_thread_test() {
    crate::utils::testing::async_context(|| {
      let inbox = Inbox::new(Backpressure::Block(1));
      inbox.push(Ok(1));
      let producer = {
        let inbox = inbox.clone();
        thread::spawn(move || inbox.push(Ok(2)))
      };
      thread::sleep(std::time::Duration::from_millis(20));
      assert_eq!(inbox.len(), 1);
      let waker = noop_waker();
      assert_eq!(inbox.poll_item(&waker), Poll::Ready(Some(Ok(1))));
      producer.join().unwrap();
      assert_eq!(inbox.poll_item(&waker), Poll::Ready(Some(Ok(2))));
    });
  }
}
