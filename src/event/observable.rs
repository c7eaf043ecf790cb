use super::consumer::{Backpressure, Consumer, Inbox, NextSignal};
use super::dispatcher::{Connection, Dispatcher, Listener};
use super::scheduler::{default_scheduler, make_scheduler, Scheduler, SchedulerType};
use super::subscription::{Detach, Subscription};
use crate::error::{panic_message, EventError, Result};

use futures::TryStreamExt;
use log::{debug, error, warn};

use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

pub trait Payload: Send + Sync + Clone + Debug + 'static {}

impl<T> Payload for T where T: Send + Sync + Clone + Debug + 'static {}

fn id() -> usize {
  static ID: AtomicUsize = AtomicUsize::new(0);
  ID.fetch_add(1, Ordering::Relaxed)
}

struct State<T> {
  dispatcher: Dispatcher<T>,
  done: bool,
  last: Option<T>,
  error: Option<EventError>,
  consumer: Option<Arc<Inbox<T>>>,
}

#[derive(Default)]
struct Links {
  upstream: Vec<Subscription>,
  finalize: Vec<Box<dyn FnOnce() + Send>>,
  closed: bool,
}

pub(crate) struct EventInner<T> {
  id: usize,
  name: String,
  scheduler: Arc<dyn Scheduler>,
  // Derived events and scheduled sources end once their last listener leaves.
  cascade: bool,
  state: Mutex<State<T>>,
  links: Mutex<Links>,
}

impl<T> EventInner<T>
where
  T: Payload,
{
  fn lock(&self) -> MutexGuard<'_, State<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn links(&self) -> MutexGuard<'_, Links> {
    self.links.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, value: T) {
    let (targets, dead, inbox) = {
      let mut state = self.lock();
      if state.done {
        warn!("`{}` emitted {:?} after done", self.name, value);
        return;
      }
      state.last = Some(value.clone());
      let (targets, dead) = state.dispatcher.targets();
      (targets, dead, state.consumer.clone())
    };
    if let Some(inbox) = inbox {
      inbox.push(Ok(value.clone()));
    }
    for listener in targets {
      if self.lock().done {
        break;
      }
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.receive(value.clone())));
      let failure = match outcome {
        Ok(Ok(())) => continue,
        Ok(Err(cause)) => EventError::listener(&self.name, cause),
        Err(payload) => EventError::from_panic(&self.name, payload),
      };
      self.emit_error(failure);
    }
    if dead {
      let pruned = self.lock().dispatcher.prune();
      drop(pruned);
    }
  }

  fn emit_error(&self, error: EventError) {
    let (handlers, inbox) = {
      let mut state = self.lock();
      if state.done {
        warn!("`{}` emitted error after done: {}", self.name, error);
        return;
      }
      state.error = Some(error.clone());
      (state.dispatcher.error_handlers(), state.consumer.clone())
    };
    if handlers.is_empty() {
      error!("unhandled error on `{}`: {}", self.name, error);
    }
    if let Some(inbox) = inbox {
      inbox.push(Err(error.clone()));
    }
    for handler in handlers {
      if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(&error))) {
        error!(
          "error listener on `{}` {}",
          self.name,
          panic_message(payload.as_ref())
        );
      }
    }
  }

  fn set_done(&self) {
    let (handlers, slots, inbox) = {
      let mut state = self.lock();
      if state.done {
        return;
      }
      state.done = true;
      let handlers = state.dispatcher.done_handlers();
      (handlers, state.dispatcher.clear(), state.consumer.take())
    };
    debug!("`{}` done", self.name);
    self.teardown();
    if let Some(inbox) = inbox {
      inbox.finish();
    }
    for handler in handlers {
      if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler())) {
        error!(
          "done listener on `{}` {}",
          self.name,
          panic_message(payload.as_ref())
        );
      }
    }
    drop(slots);
  }

  /// Releases upstream subscriptions and runs finalizers, exactly once.
  fn teardown(&self) {
    let (upstream, finalize) = {
      let mut links = self.links();
      links.closed = true;
      (
        std::mem::take(&mut links.upstream),
        std::mem::take(&mut links.finalize),
      )
    };
    if !upstream.is_empty() {
      debug!(
        "`{}` releasing {} upstream subscription(s)",
        self.name,
        upstream.len()
      );
    }
    for subscription in upstream {
      subscription.disconnect();
    }
    for task in finalize {
      task();
    }
  }
}

impl<T> Detach for EventInner<T>
where
  T: Payload,
{
  fn detach(&self, slot: usize) {
    let (removed, orphaned) = {
      let mut state = self.lock();
      let removed = state.dispatcher.remove(slot);
      let orphaned = self.cascade
        && !state.done
        && removed.as_ref().map_or(false, |slot| !slot.transient)
        && state.dispatcher.is_empty()
        && state.consumer.is_none();
      (removed, orphaned)
    };
    drop(removed);
    if orphaned {
      debug!("`{}` lost its last listener", self.name);
      self.set_done();
    }
  }

  fn name(&self) -> String {
    self.name.clone()
  }
}

impl<T> Drop for EventInner<T> {
  fn drop(&mut self) {
    let links = std::mem::take(
      &mut *self.links.lock().unwrap_or_else(PoisonError::into_inner),
    );
    for subscription in links.upstream {
      subscription.disconnect();
    }
    for task in links.finalize {
      task();
    }
  }
}

/// The event is the node every source and operator is made of.
///
/// It is at the same time:
/// * a synchronous dispatcher: [emit](Event::emit) calls every connected
///   listener in registration order on the caller's thread.
/// * a single consumer asynchronous stream, see [consume](Event::consume).
///
/// An event receives any number of values and errors followed by at most one
/// done signal, after which it is inert. Events are cheap handles, clones refer
/// to the same node.
///
/// # Example
/// ```
/// use eventflow::Event;
/// use std::sync::{Arc, Mutex};
///
/// let event = Event::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let captured = seen.clone();
/// event.subscribe(move |x: i32| captured.lock().unwrap().push(x));
/// event.emit(1);
/// event.emit(2);
/// event.set_done();
/// event.emit(3);
/// assert_eq!(*seen.lock().unwrap(), [1, 2]);
/// ```
pub struct Event<T>
where
  T: Payload,
{
  inner: Arc<EventInner<T>>,
}

impl<T> Clone for Event<T>
where
  T: Payload,
{
  fn clone(&self) -> Self {
    Event {
      inner: self.inner.clone(),
    }
  }
}

impl<T> Default for Event<T>
where
  T: Payload,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Debug for Event<T>
where
  T: Payload,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let state = self.inner.lock();
    f.debug_struct("Event")
      .field("name", &self.inner.name)
      .field("listeners", &state.dispatcher.len())
      .field("done", &state.done)
      .finish()
  }
}

impl<T> Event<T>
where
  T: Payload,
{
  /// A plain event on the default scheduler, fed by calling
  /// [emit](Event::emit).
  pub fn new() -> Self {
    EventBuilder::new().build()
  }

  pub(crate) fn with(name: String, scheduler: Arc<dyn Scheduler>, cascade: bool) -> Self {
    Event {
      inner: Arc::new(EventInner {
        id: id(),
        name,
        scheduler,
        cascade,
        state: Mutex::new(State {
          dispatcher: Dispatcher::default(),
          done: false,
          last: None,
          error: None,
          consumer: None,
        }),
        links: Mutex::new(Links::default()),
      }),
    }
  }

  /// A derived event named after `self` which shares its scheduler.
  pub(crate) fn derive<B>(&self, operator: &str) -> Event<B>
  where
    B: Payload,
  {
    Event::with(
      format!("{}.{}", self.inner.name, operator),
      self.scheduler(),
      true,
    )
  }

  pub fn id(&self) -> usize {
    self.inner.id
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn scheduler(&self) -> Arc<dyn Scheduler> {
    self.inner.scheduler.clone()
  }

  fn detach_handle(&self) -> Weak<dyn Detach> {
    let weak: Weak<EventInner<T>> = Arc::downgrade(&self.inner);
    weak
  }

  fn register(
    &self,
    mut connection: Connection<T>,
    transient: bool,
    checked: bool,
  ) -> Result<Subscription> {
    let mut state = self.inner.lock();
    if state.done {
      drop(state);
      if let Some(done) = connection.take_done() {
        done();
      }
      return Ok(Subscription::inactive(self.detach_handle()));
    }
    let slot = if checked {
      state.dispatcher.insert(connection, transient)
    } else {
      Ok(state.dispatcher.push(connection, transient))
    };
    drop(state);
    match slot {
      Ok(slot) => Ok(Subscription::new(slot, self.detach_handle())),
      Err(rejected) => {
        drop(rejected);
        debug!("rejected duplicate listener on `{}`", self.name());
        Err(EventError::AlreadyConnected(self.name().to_owned()))
      }
    }
  }

  /// Registers a connection. Connecting to an event which is already done
  /// calls the done callback right away and returns an inactive subscription.
  ///
  /// Fails with [AlreadyConnected](EventError::AlreadyConnected) if the
  /// listener instance is already registered.
  pub fn connect(&self, connection: Connection<T>) -> Result<Subscription> {
    self.register(connection, false, true)
  }

  /// Registers an unkeyed connection, which can not be rejected. Removing a
  /// transient registration never ends the event.
  pub(crate) fn attach(&self, connection: Connection<T>, transient: bool) -> Subscription {
    match self.register(connection, transient, false) {
      Ok(subscription) => subscription,
      Err(_) => Subscription::inactive(self.detach_handle()),
    }
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    self.attach(Connection::func(listener), false)
  }

  pub fn on_error<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&EventError) + Send + Sync + 'static,
  {
    self.attach(Connection::detached().on_error(handler), false)
  }

  pub fn on_done<F>(&self, handler: F) -> Subscription
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.attach(Connection::detached().on_done(handler), false)
  }

  /// Removes the registration of `listener`.
  pub fn disconnect_listener<L>(&self, listener: &Arc<L>) -> Result<()>
  where
    L: Listener<T>,
  {
    let slot = self.inner.lock().dispatcher.position_of(Arc::as_ptr(listener));
    match slot {
      Some(slot) => {
        self.inner.detach(slot);
        Ok(())
      }
      None => Err(EventError::NotConnected(self.name().to_owned())),
    }
  }

  pub fn emit(&self, value: T) {
    self.inner.emit(value)
  }

  pub fn emit_error(&self, error: EventError) {
    self.inner.emit_error(error)
  }

  pub fn set_done(&self) {
    self.inner.set_done()
  }

  /// Attaches the single asynchronous consumer with an unbounded inbox.
  ///
  /// # Example
  /// ```
  /// use eventflow::EventBuilder;
  /// use eventflow::event::scheduler::SchedulerType;
  /// use futures::executor::block_on;
  /// use futures::StreamExt;
  ///
  /// let event = EventBuilder::new()
  ///   .scheduler_type(SchedulerType::Virtual)
  ///   .sequence(vec![1, 2, 3]);
  /// let values: Vec<_> = block_on(event.consume().unwrap().collect());
  /// assert_eq!(values, [Ok(1), Ok(2), Ok(3)]);
  /// ```
  pub fn consume(&self) -> Result<Consumer<T>> {
    self.consume_with(Backpressure::Unbounded)
  }

  /// Fails with [ConsumerConflict](EventError::ConsumerConflict) while
  /// another consumer is attached.
  pub fn consume_with(&self, policy: Backpressure) -> Result<Consumer<T>> {
    let policy = policy.validate()?;
    let inbox = Inbox::new(policy);
    {
      let mut state = self.inner.lock();
      if state.consumer.is_some() {
        return Err(EventError::ConsumerConflict(self.name().to_owned()));
      }
      if state.done {
        inbox.finish();
      } else {
        state.consumer = Some(inbox.clone());
      }
    }
    debug!("consumer attached to `{}` with {:?}", self.name(), policy);
    Ok(Consumer::new(self.clone(), inbox))
  }

  /// A consumer which only ever sees the most recent value when it falls
  /// behind.
  pub fn skip_to_last(&self) -> Result<Consumer<T>> {
    self.consume_with(Backpressure::KeepLatest)
  }

  pub(crate) fn release_consumer(&self, inbox: &Arc<Inbox<T>>) {
    let orphaned = {
      let mut state = self.inner.lock();
      match &state.consumer {
        Some(current) if Arc::ptr_eq(current, inbox) => {
          state.consumer = None;
          self.inner.cascade && !state.done && state.dispatcher.is_empty()
        }
        _ => false,
      }
    };
    if orphaned {
      debug!("`{}` lost its consumer", self.name());
      self.set_done();
    }
  }

  pub fn await_next(&self) -> NextSignal<T> {
    NextSignal::new(self)
  }

  /// Drives the scheduler until the event is done and returns every value,
  /// or the first error. Does not return for an event nobody ends.
  pub fn run(&self) -> Result<Vec<T>> {
    let consumer = self.consume()?;
    futures::executor::block_on(consumer.try_collect())
  }

  /// Applies an operator, `event.pipe(f)` is `f(&event)`.
  pub fn pipe<B, F>(&self, operator: F) -> Event<B>
  where
    B: Payload,
    F: FnOnce(&Event<T>) -> Event<B>,
  {
    operator(self)
  }

  /// The last emitted value.
  pub fn value(&self) -> Option<T> {
    self.inner.lock().last.clone()
  }

  /// The last emitted error.
  pub fn error(&self) -> Option<EventError> {
    self.inner.lock().error.clone()
  }

  pub fn is_done(&self) -> bool {
    self.inner.lock().done
  }

  /// Number of registrations.
  pub fn len(&self) -> usize {
    self.inner.lock().dispatcher.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub(crate) fn add_upstream(&self, subscription: Subscription) {
    let mut links = self.inner.links();
    if links.closed {
      drop(links);
      subscription.disconnect();
    } else {
      links.upstream.push(subscription);
    }
  }

  /// Runs `task` when the event is done or dropped.
  pub(crate) fn on_teardown<F>(&self, task: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let mut links = self.inner.links();
    if links.closed {
      drop(links);
      task();
    } else {
      links.finalize.push(Box::new(task));
    }
  }
}

/// Configures and creates events.
///
/// Sources such as [sequence](EventBuilder::sequence) are built from the
/// builder too, see the `create` operators.
#[derive(Default)]
pub struct EventBuilder {
  name: Option<String>,
  scheduler: Option<Arc<dyn Scheduler>>,
  interval: Duration,
}

impl EventBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn name<S>(mut self, name: S) -> Self
  where
    S: Into<String>,
  {
    self.name = Some(name.into());
    self
  }

  pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  pub fn scheduler_type(mut self, strategy: SchedulerType) -> Self {
    self.scheduler = Some(make_scheduler(strategy));
    self
  }

  /// Time between two emissions of a scheduled source, zero by default.
  pub fn interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  fn resolve(self, fallback: &str) -> (String, Arc<dyn Scheduler>, Duration) {
    let name = self
      .name
      .unwrap_or_else(|| format!("{}{}", fallback, id()));
    let scheduler = self.scheduler.unwrap_or_else(default_scheduler);
    (name, scheduler, self.interval)
  }

  pub fn build<T>(self) -> Event<T>
  where
    T: Payload,
  {
    let (name, scheduler, _) = self.resolve("event");
    Event::with(name, scheduler, false)
  }

  /// An event fed by a scheduled driver, ended once its last listener
  /// leaves, and the configured interval of the driver.
  pub(crate) fn source<T>(self, kind: &str) -> (Event<T>, Duration)
  where
    T: Payload,
  {
    let (name, scheduler, interval) = self.resolve(kind);
    (Event::with(name, scheduler, true), interval)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::scheduler::VirtualScheduler;
  use std::sync::atomic::AtomicBool;

  fn event<T: Payload>() -> Event<T> {
    EventBuilder::new()
      .name("test")
      .scheduler(VirtualScheduler::new())
      .build()
  }

  #[test]
  fn emit_order_test() {
    let source = event::<i32>();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..3 {
      let seen = seen.clone();
      source.subscribe(move |x| seen.lock().unwrap().push((tag, x)));
    }
    source.emit(1);
    source.emit(2);
    assert_eq!(
      *seen.lock().unwrap(),
      [(0, 1), (1, 1), (2, 1), (0, 2), (1, 2), (2, 2)]
    );
    assert_eq!(source.value(), Some(2));
  }

  #[test]
  fn done_is_terminal_test() {
    let source = event::<i32>();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));
    let captured = seen.clone();
    source.subscribe(move |x| captured.lock().unwrap().push(x));
    let captured = done.clone();
    source.on_done(move || {
      captured.fetch_add(1, Ordering::Relaxed);
    });
    source.emit(1);
    source.set_done();
    source.set_done();
    source.emit(2);
    source.emit_error(EventError::custom("late"));
    assert_eq!(*seen.lock().unwrap(), [1]);
    assert_eq!(done.load(Ordering::Relaxed), 1);
    assert!(source.is_done());
    assert!(source.is_empty());
    assert_eq!(source.error(), None);
  }

  #[test]
  fn connect_after_done_test() {
    let source = event::<i32>();
    source.set_done();
    let called = Arc::new(AtomicBool::new(false));
    let captured = called.clone();
    let subscription = source
      .connect(Connection::func(|_: i32| {}).on_done(move || captured.store(true, Ordering::Relaxed)))
      .unwrap();
    assert!(called.load(Ordering::Relaxed));
    assert!(!subscription.active());
  }

  #[test]
  fn disconnect_during_dispatch_test() {
    let source = event::<i32>();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let later: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let captured = later.clone();
    source.subscribe(move |_| {
      if let Some(subscription) = captured.lock().unwrap().as_ref() {
        subscription.disconnect();
      }
    });
    let captured = seen.clone();
    *later.lock().unwrap() = Some(source.subscribe(move |x| captured.lock().unwrap().push(x)));
    source.emit(1);
    source.emit(2);
    assert_eq!(*seen.lock().unwrap(), [1]);
    assert_eq!(source.len(), 1);
  }

  #[test]
  fn disconnect_listener_test() {
    let source = event::<i32>();
    let listener = Arc::new(|_: i32| {});
    source.connect(Connection::strong(listener.clone())).unwrap();
    assert_eq!(
      source.connect(Connection::strong(listener.clone())).unwrap_err(),
      EventError::AlreadyConnected("test".to_owned())
    );
    assert!(source.disconnect_listener(&listener).is_ok());
    assert_eq!(
      source.disconnect_listener(&listener),
      Err(EventError::NotConnected("test".to_owned()))
    );
    assert!(!source.is_done());
  }

  #[test]
  fn derived_cascade_test() {
    let source = event::<i32>();
    let derived = source.derive::<i32>("derived");
    let forward = derived.clone();
    derived.add_upstream(source.subscribe(move |x| forward.emit(x)));
    assert_eq!(source.len(), 1);
    let subscription = derived.subscribe(|_| {});
    subscription.disconnect();
    assert!(derived.is_done());
    assert_eq!(source.len(), 0);
    assert!(!source.is_done());
  }

  #[test]
  fn teardown_once_test() {
    let source = event::<i32>();
    let count = Arc::new(AtomicUsize::new(0));
    let captured = count.clone();
    source.on_teardown(move || {
      captured.fetch_add(1, Ordering::Relaxed);
    });
    source.set_done();
    drop(source);
    assert_eq!(count.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn consumer_conflict_test() {
    let source = event::<i32>();
    let first = source.consume().unwrap();
    assert_eq!(
      source.consume().err(),
      Some(EventError::ConsumerConflict("test".to_owned()))
    );
    drop(first);
    assert!(source.consume().is_ok());
    assert!(source.consume_with(Backpressure::Block(0)).is_err());
  }
}
