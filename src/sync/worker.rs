use super::executor::Executor;
use crate::error::{panic_message, EventError};

use log::{debug, error};

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;

struct Slot<R> {
  result: Option<Result<R, EventError>>,
  waker: Option<Waker>,
}

/// Future of the result of a closure submitted to a [Worker] or
/// [WorkerPool].
pub struct Completion<R> {
  slot: Arc<Mutex<Slot<R>>>,
}

impl<R> Completion<R> {
  fn new() -> (Self, Arc<Mutex<Slot<R>>>) {
    let slot = Arc::new(Mutex::new(Slot {
      result: None,
      waker: None,
    }));
    (Completion { slot: slot.clone() }, slot)
  }

  /// A completion which resolved before it was handed out.
  fn resolved(result: Result<R, EventError>) -> Self {
    let (completion, slot) = Self::new();
    fulfill(&slot, result);
    completion
  }
}

fn lock<R>(slot: &Mutex<Slot<R>>) -> MutexGuard<'_, Slot<R>> {
  slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fulfill<R>(slot: &Mutex<Slot<R>>, result: Result<R, EventError>) {
  let waker = {
    let mut slot = lock(slot);
    slot.result = Some(result);
    slot.waker.take()
  };
  if let Some(waker) = waker {
    waker.wake();
  }
}

impl<R> Future for Completion<R> {
  type Output = Result<R, EventError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut slot = lock(&self.slot);
    match slot.result.take() {
      Some(result) => Poll::Ready(result),
      None => {
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
      }
    }
  }
}

type Work = Box<dyn FnOnce() + Send>;

enum WorkerSignal {
  Run(Work),
  Close,
}

struct WorkerInner {
  sender: Mutex<Sender<WorkerSignal>>,
  queued: Arc<AtomicIsize>,
}

/// A thread running submitted closures one at a time, in submission order.
///
/// Dropping the last handle lets the thread finish the queued closures and
/// quit.
///
/// # Example
/// ```
/// use eventflow::sync::executor::Executor;
/// use eventflow::sync::worker::Worker;
/// use futures::executor::block_on;
///
/// let worker = Worker::new();
/// let first = worker.execute(|| 10);
/// let second = worker.execute(|| 5);
/// assert_eq!(block_on(first).unwrap() + block_on(second).unwrap(), 15);
/// ```
#[derive(Clone)]
pub struct Worker {
  inner: Arc<WorkerInner>,
}

impl Default for Worker {
  fn default() -> Self {
    Self::new_with_handle().0
  }
}

impl Worker {
  fn new_with_handle() -> (Self, Option<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel();
    let queued = Arc::new(AtomicIsize::new(0));
    (
      Worker {
        inner: Arc::new(WorkerInner {
          sender: Mutex::new(tx),
          queued: queued.clone(),
        }),
      },
      Self::run(rx, queued),
    )
  }

  pub fn new() -> Self {
    Self::default()
  }

  fn run(receiver: Receiver<WorkerSignal>, queued: Arc<AtomicIsize>) -> Option<JoinHandle<()>> {
    static ID: AtomicUsize = AtomicUsize::new(0);
    let id = ID.fetch_add(1, Ordering::Relaxed);
    let spawned = std::thread::Builder::new()
      .name(format!("worker{}", id))
      .spawn(move || {
        while let Ok(WorkerSignal::Run(work)) = receiver.recv() {
          work();
          queued.fetch_sub(1, Ordering::Relaxed);
        }
        debug!("worker{} closing", id);
      });
    match spawned {
      Ok(handle) => Some(handle),
      Err(cause) => {
        error!("failed to spawn worker{}: {}", id, cause);
        None
      }
    }
  }

  /// Number of closures submitted but not finished yet.
  pub fn queued(&self) -> usize {
    self.inner.queued.load(Ordering::Relaxed).max(0) as usize
  }

  pub fn idle(&self) -> bool {
    self.queued() == 0
  }
}

impl Executor for Worker {
  fn execute<F, R>(&self, task: F) -> Completion<R>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    let (completion, slot) = Completion::new();
    let work: Work = Box::new(move || {
      let result = panic::catch_unwind(AssertUnwindSafe(task))
        .map_err(|payload| EventError::Executor(panic_message(payload.as_ref())));
      fulfill(&slot, result);
    });
    self.inner.queued.fetch_add(1, Ordering::Relaxed);
    let sent = self
      .inner
      .sender
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .send(WorkerSignal::Run(work));
    match sent {
      Ok(()) => completion,
      Err(_) => {
        self.inner.queued.fetch_sub(1, Ordering::Relaxed);
        Completion::resolved(Err(EventError::Executor(
          "worker thread is gone".to_owned(),
        )))
      }
    }
  }
}

impl Drop for WorkerInner {
  fn drop(&mut self) {
    let _ = self
      .sender
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .send(WorkerSignal::Close);
  }
}

/// A fixed set of workers, one per cpu by default. Each closure goes to the
/// least busy worker.
#[derive(Clone)]
pub struct WorkerPool {
  workers: Arc<Vec<Worker>>,
}

impl Default for WorkerPool {
  fn default() -> Self {
    Self::new(num_cpus::get())
  }
}

impl WorkerPool {
  pub fn new(size: usize) -> Self {
    WorkerPool {
      workers: Arc::new((0..size.max(1)).map(|_| Worker::new()).collect()),
    }
  }

  pub fn size(&self) -> usize {
    self.workers.len()
  }

  pub fn queued(&self) -> usize {
    self.workers.iter().map(Worker::queued).sum()
  }
}

impl Executor for WorkerPool {
  fn execute<F, R>(&self, task: F) -> Completion<R>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    match self.workers.iter().min_by_key(|worker| worker.queued()) {
      Some(worker) => worker.execute(task),
      None => Completion::resolved(Err(EventError::Executor(
        "worker pool is empty".to_owned(),
      ))),
    }
  }
}
