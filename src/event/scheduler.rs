//! Timer service shared by sources, timing operators and asynchronous
//! consumption.
//!
//! Execution is cooperative: no timer task runs on a thread of its own. A
//! pending timer only fires when somebody drives the scheduler, either
//! through the blocking [step](Scheduler::step) or through
//! [step_due](Scheduler::step_due), which is what consumers do while they
//! wait for a value. [VirtualScheduler] jumps a simulated clock straight to
//! the next deadline, [RealtimeScheduler] waits for the wall clock.
use log::{error, trace};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::Waker;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulerType {
  Virtual,
  Realtime,
}

pub struct Task {
  func: Box<dyn FnOnce() + Send>,
}

impl Task {
  pub fn new<F>(func: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    Task {
      func: Box::new(func),
    }
  }

  pub fn invoke(self) {
    (self.func)()
  }
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellable handle of a registered timer.
///
/// A timer either fires or is cancelled, never both: the transition out of
/// the pending state is a single compare and swap.
#[derive(Clone, Debug)]
pub struct TimerHandle {
  state: Arc<AtomicU8>,
  deadline: Duration,
}

impl TimerHandle {
  fn new(deadline: Duration) -> Self {
    TimerHandle {
      state: Arc::new(AtomicU8::new(PENDING)),
      deadline,
    }
  }

  /// Returns `true` if the timer was still pending and will now never fire.
  pub fn cancel(&self) -> bool {
    self
      .state
      .compare_exchange(
        PENDING,
        CANCELLED,
        AtomicOrdering::AcqRel,
        AtomicOrdering::Acquire,
      )
      .is_ok()
  }

  pub fn is_pending(&self) -> bool {
    self.state.load(AtomicOrdering::Acquire) == PENDING
  }

  pub fn deadline(&self) -> Duration {
    self.deadline
  }

  fn fire(&self) -> bool {
    self
      .state
      .compare_exchange(
        PENDING,
        FIRED,
        AtomicOrdering::AcqRel,
        AtomicOrdering::Acquire,
      )
      .is_ok()
  }
}

pub trait Scheduler: Send + Sync {
  /// Time elapsed since the scheduler was created.
  fn now(&self) -> Duration;
  /// Registers `task` to run once `delay` has elapsed.
  fn after(&self, delay: Duration, task: Task) -> TimerHandle;
  /// Runs the earliest pending timer, waiting for its deadline first.
  /// Returns `false` if no timer is pending.
  fn step(&self) -> bool;
  /// Runs the earliest pending timer if it is due and returns `true`. Never
  /// waits: otherwise `waker` is registered to be woken once a timer falls
  /// due or a new timer is registered, and `false` is returned.
  fn step_due(&self, waker: &Waker) -> bool;
  /// Number of timers which are neither fired nor cancelled.
  fn pending(&self) -> usize;
  fn scheduler_type(&self) -> SchedulerType;
}

impl dyn Scheduler {
  pub fn call_later<F>(&self, delay: Duration, func: F) -> TimerHandle
  where
    F: FnOnce() + Send + 'static,
  {
    self.after(delay, Task::new(func))
  }

  /// Steps until no timer is pending. Does not return while an infinite
  /// source is attached.
  pub fn run(&self) {
    while self.step() {}
  }
}

struct Entry {
  deadline: Duration,
  seq: u64,
  task: Task,
  handle: TimerHandle,
}

impl PartialEq for Entry {
  fn eq(&self, other: &Self) -> bool {
    self.deadline == other.deadline && self.seq == other.seq
  }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// Reversed so the binary heap pops the earliest deadline, FIFO among equals.
impl Ord for Entry {
  fn cmp(&self, other: &Self) -> Ordering {
    other
      .deadline
      .cmp(&self.deadline)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

#[derive(Default)]
struct TimerQueue {
  heap: BinaryHeap<Entry>,
  seq: u64,
  parked: Vec<Waker>,
}

impl TimerQueue {
  fn push(&mut self, deadline: Duration, task: Task) -> (TimerHandle, Vec<Waker>) {
    let handle = TimerHandle::new(deadline);
    self.seq += 1;
    self.heap.push(Entry {
      deadline,
      seq: self.seq,
      task,
      handle: handle.clone(),
    });
    (handle, std::mem::take(&mut self.parked))
  }

  fn next_deadline(&mut self) -> Option<Duration> {
    while let Some(entry) = self.heap.peek() {
      if entry.handle.is_pending() {
        return Some(entry.deadline);
      }
      self.heap.pop();
    }
    None
  }

  fn pop(&mut self) -> Option<Entry> {
    self.next_deadline()?;
    self.heap.pop()
  }

  fn pending(&self) -> usize {
    self
      .heap
      .iter()
      .filter(|entry| entry.handle.is_pending())
      .count()
  }

  fn park(&mut self, waker: &Waker) {
    if !self.parked.iter().any(|parked| parked.will_wake(waker)) {
      self.parked.push(waker.clone());
    }
  }
}

fn fire(entry: Entry) {
  if entry.handle.fire() {
    trace!("firing timer due at {:?}", entry.deadline);
    let task = entry.task;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.invoke())) {
      error!(
        "timer task due at {:?} {}",
        entry.deadline,
        crate::error::panic_message(payload.as_ref())
      );
    }
  }
}

fn wake_all(wakers: Vec<Waker>) {
  for waker in wakers {
    waker.wake();
  }
}

struct VirtualClock {
  now: Duration,
  queue: TimerQueue,
}

/// Scheduler over a simulated clock. Time only moves when the scheduler is
/// stepped or advanced, which makes timing behavior fully deterministic.
pub struct VirtualScheduler {
  clock: Mutex<VirtualClock>,
}

impl VirtualScheduler {
  pub fn new() -> Arc<Self> {
    Arc::new(VirtualScheduler {
      clock: Mutex::new(VirtualClock {
        now: Duration::from_secs(0),
        queue: TimerQueue::default(),
      }),
    })
  }

  fn lock(&self) -> MutexGuard<'_, VirtualClock> {
    self.clock.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Moves the clock forward by `duration`, firing every timer that falls due
  /// on the way at its own deadline.
  pub fn advance(&self, duration: Duration) {
    let target = self.now().saturating_add(duration);
    loop {
      let entry = {
        let mut clock = self.lock();
        match clock.queue.next_deadline() {
          Some(deadline) if deadline <= target => {
            if deadline > clock.now {
              clock.now = deadline;
            }
            clock.queue.pop()
          }
          _ => {
            if clock.now < target {
              clock.now = target;
            }
            None
          }
        }
      };
      match entry {
        Some(entry) => fire(entry),
        None => break,
      }
    }
  }

  /// Steps until no timer is pending.
  pub fn run(&self) {
    while self.step() {}
  }
}

impl Scheduler for VirtualScheduler {
  fn now(&self) -> Duration {
    self.lock().now
  }

  fn after(&self, delay: Duration, task: Task) -> TimerHandle {
    let (handle, parked) = {
      let mut clock = self.lock();
      let deadline = clock.now.saturating_add(delay);
      clock.queue.push(deadline, task)
    };
    trace!("virtual timer registered for {:?}", handle.deadline());
    wake_all(parked);
    handle
  }

  fn step(&self) -> bool {
    let entry = {
      let mut clock = self.lock();
      match clock.queue.pop() {
        Some(entry) => {
          if entry.deadline > clock.now {
            clock.now = entry.deadline;
          }
          entry
        }
        None => return false,
      }
    };
    fire(entry);
    true
  }

  fn step_due(&self, waker: &Waker) -> bool {
    {
      let mut clock = self.lock();
      if clock.queue.next_deadline().is_none() {
        clock.queue.park(waker);
        return false;
      }
    }
    self.step()
  }

  fn pending(&self) -> usize {
    self.lock().queue.pending()
  }

  fn scheduler_type(&self) -> SchedulerType {
    SchedulerType::Virtual
  }
}

struct Alarm {
  timers: TimerQueue,
  running: bool,
  stopped: bool,
}

struct Wall {
  alarm: Mutex<Alarm>,
  signal: Condvar,
}

impl Wall {
  fn lock(&self) -> MutexGuard<'_, Alarm> {
    self.alarm.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn wait_until<'a>(
    &self,
    guard: MutexGuard<'a, Alarm>,
    timeout: Option<Duration>,
  ) -> MutexGuard<'a, Alarm> {
    match timeout {
      Some(timeout) => match self.signal.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
      },
      None => self.signal.wait(guard).unwrap_or_else(PoisonError::into_inner),
    }
  }
}

/// Wakes parked drivers once the earliest deadline passes. Runs no task.
fn ring(wall: Arc<Wall>, epoch: Instant) {
  let mut alarm = wall.lock();
  loop {
    if alarm.stopped {
      return;
    }
    let deadline = alarm.timers.next_deadline();
    alarm = match deadline {
      Some(deadline) if !alarm.timers.parked.is_empty() => {
        let now = epoch.elapsed();
        if deadline <= now {
          let parked = std::mem::take(&mut alarm.timers.parked);
          drop(alarm);
          wake_all(parked);
          wall.lock()
        } else {
          wall.wait_until(alarm, Some(deadline - now))
        }
      }
      _ => wall.wait_until(alarm, None),
    };
  }
}

/// Scheduler over the wall clock. Stepping blocks the calling thread until
/// the earliest deadline, waking early when a sooner timer is registered.
/// Drivers waiting through [step_due](Scheduler::step_due) are woken by a
/// helper thread, started on first use, once a deadline passes.
pub struct RealtimeScheduler {
  epoch: Instant,
  wall: Arc<Wall>,
}

impl RealtimeScheduler {
  pub fn new() -> Arc<Self> {
    Arc::new(RealtimeScheduler {
      epoch: Instant::now(),
      wall: Arc::new(Wall {
        alarm: Mutex::new(Alarm {
          timers: TimerQueue::default(),
          running: false,
          stopped: false,
        }),
        signal: Condvar::new(),
      }),
    })
  }

  fn lock(&self) -> MutexGuard<'_, Alarm> {
    self.wall.lock()
  }

  fn start_alarm(&self, alarm: &mut Alarm) {
    if alarm.running {
      return;
    }
    let wall = self.wall.clone();
    let epoch = self.epoch;
    match thread::Builder::new()
      .name("eventflow-alarm".to_owned())
      .spawn(move || ring(wall, epoch))
    {
      Ok(_) => alarm.running = true,
      Err(err) => error!("failed to start realtime alarm thread: {}", err),
    }
  }
}

impl Scheduler for RealtimeScheduler {
  fn now(&self) -> Duration {
    self.epoch.elapsed()
  }

  fn after(&self, delay: Duration, task: Task) -> TimerHandle {
    let deadline = self.now().saturating_add(delay);
    let (handle, parked) = self.lock().timers.push(deadline, task);
    trace!("realtime timer registered for {:?}", deadline);
    self.wall.signal.notify_all();
    wake_all(parked);
    handle
  }

  fn step(&self) -> bool {
    let mut alarm = self.lock();
    loop {
      let deadline = match alarm.timers.next_deadline() {
        Some(deadline) => deadline,
        None => return false,
      };
      let now = self.now();
      if deadline <= now {
        let entry = alarm.timers.pop();
        drop(alarm);
        if let Some(entry) = entry {
          fire(entry);
        }
        return true;
      }
      alarm = self.wall.wait_until(alarm, Some(deadline - now));
    }
  }

  fn step_due(&self, waker: &Waker) -> bool {
    let entry = {
      let mut alarm = self.lock();
      match alarm.timers.next_deadline() {
        Some(deadline) if deadline <= self.now() => alarm.timers.pop(),
        pending => {
          alarm.timers.park(waker);
          if pending.is_some() {
            self.start_alarm(&mut alarm);
            self.wall.signal.notify_all();
          }
          None
        }
      }
    };
    match entry {
      Some(entry) => {
        fire(entry);
        true
      }
      None => false,
    }
  }

  fn pending(&self) -> usize {
    self.lock().timers.pending()
  }

  fn scheduler_type(&self) -> SchedulerType {
    SchedulerType::Realtime
  }
}

impl Drop for RealtimeScheduler {
  fn drop(&mut self) {
    self.lock().stopped = true;
    self.wall.signal.notify_all();
  }
}

lazy_static! {
  static ref DEFAULT_SCHEDULER: RwLock<Arc<dyn Scheduler>> =
    RwLock::new(RealtimeScheduler::new() as Arc<dyn Scheduler>);
}

/// The process-wide scheduler used by events built without an explicit one.
pub fn default_scheduler() -> Arc<dyn Scheduler> {
  DEFAULT_SCHEDULER
    .read()
    .unwrap_or_else(PoisonError::into_inner)
    .clone()
}

pub fn set_default_scheduler(scheduler: Arc<dyn Scheduler>) {
  *DEFAULT_SCHEDULER
    .write()
    .unwrap_or_else(PoisonError::into_inner) = scheduler;
}

pub fn make_scheduler(strategy: SchedulerType) -> Arc<dyn Scheduler> {
  match strategy {
    SchedulerType::Virtual => VirtualScheduler::new(),
    SchedulerType::Realtime => RealtimeScheduler::new(),
  }
}
