use crate::event::scheduler::Scheduler;

use futures::future::BoxFuture;
use futures::FutureExt;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

type Completion<T> = Box<dyn FnOnce(T) + Send>;

struct JobInner<T> {
  future: Option<BoxFuture<'static, T>>,
  complete: Option<Completion<T>>,
}

/// A future driven to completion by a scheduler.
///
/// Every wake up schedules one poll as an immediately due task, so the future
/// only ever runs from inside [step](Scheduler::step). The output is handed
/// to the completion callback.
pub struct Job<T> {
  inner: Mutex<JobInner<T>>,
  scheduler: Arc<dyn Scheduler>,
  scheduled: AtomicBool,
}

impl<T> Wake for Job<T>
where
  T: Send + 'static,
{
  fn wake(self: Arc<Self>) {
    self.resume();
  }
}

impl<T> Job<T>
where
  T: Send + 'static,
{
  pub fn spawn<F, C>(scheduler: Arc<dyn Scheduler>, future: F, complete: C) -> Arc<Self>
  where
    F: Future<Output = T> + Send + 'static,
    C: FnOnce(T) + Send + 'static,
  {
    let job = Arc::new(Job {
      inner: Mutex::new(JobInner {
        future: Some(future.boxed()),
        complete: Some(Box::new(complete)),
      }),
      scheduler,
      scheduled: AtomicBool::new(false),
    });
    job.clone().resume();
    job
  }

  fn lock(&self) -> MutexGuard<'_, JobInner<T>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn resume(self: Arc<Self>) {
    if self.scheduled.swap(true, Ordering::AcqRel) {
      return;
    }
    let scheduler = self.scheduler.clone();
    scheduler.call_later(Duration::from_secs(0), move || {
      self.progress();
    });
  }

  /// Polls the future once. Returns `true` once the future has completed or
  /// the job was cancelled.
  pub fn progress(self: Arc<Self>) -> bool {
    self.scheduled.store(false, Ordering::Release);
    let future = self.lock().future.take();
    let mut future = match future {
      Some(future) => future,
      None => return true,
    };
    let waker = Waker::from(self.clone());
    let mut context = Context::from_waker(&waker);
    match future.as_mut().poll(&mut context) {
      Poll::Ready(output) => {
        let complete = self.lock().complete.take();
        if let Some(complete) = complete {
          complete(output);
        }
        true
      }
      Poll::Pending => {
        let mut inner = self.lock();
        if inner.complete.is_some() {
          inner.future = Some(future);
        }
        false
      }
    }
  }

  /// Drops the future and the completion callback.
  pub fn cancel(&self) {
    let mut inner = self.lock();
    let future = inner.future.take();
    let complete = inner.complete.take();
    drop(inner);
    drop(future);
    drop(complete);
  }

  pub fn is_complete(&self) -> bool {
    let inner = self.lock();
    inner.future.is_none() && inner.complete.is_none()
  }
}
