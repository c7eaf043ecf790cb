use super::{derive, transform};
use crate::error::{EventError, Result};
use crate::event::observable::{Event, Payload};
use crate::sync::buffer::RingBuffer;
use crate::utils::stats;

use std::sync::{Mutex, PoisonError};

/// Sliding window over the last `size` values. Once the window is full every
/// value emits a snapshot of it, oldest value first.
pub fn window<T>(source: &Event<T>, size: usize) -> Result<Event<Vec<T>>>
where
  T: Payload,
{
  if size == 0 {
    return Err(EventError::construction("window size must not be zero"));
  }
  let buffer = Mutex::new(RingBuffer::new(size));
  Ok(derive(source, "window", move |node, value| {
    let snapshot = {
      let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
      buffer.push(value);
      if buffer.is_full() {
        Some(buffer.snapshot())
      } else {
        None
      }
    };
    if let Some(snapshot) = snapshot {
      node.emit(snapshot);
    }
  }))
}

pub trait Array<T>
where
  T: Payload,
{
  fn window(&self, size: usize) -> Result<Event<Vec<T>>>;
}

impl<T> Array<T> for Event<T>
where
  T: Payload,
{
  fn window(&self, size: usize) -> Result<Event<Vec<T>>> {
    window(self, size)
  }
}

fn statistic<T, F>(source: &Event<Vec<T>>, compute: F) -> Event<f64>
where
  T: Payload + Into<f64> + Copy,
  F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
{
  transform::map(source, move |window: Vec<T>| {
    let samples: Vec<f64> = window.into_iter().map(Into::into).collect();
    compute(&samples)
  })
}

/// Statistics over each window snapshot, recomputed from the whole window
/// for every snapshot.
///
/// # Example
/// ```
/// use eventflow::EventBuilder;
/// use eventflow::event::ops::{Array, WindowStats};
/// use eventflow::event::scheduler::SchedulerType;
///
/// let source = EventBuilder::new()
///   .scheduler_type(SchedulerType::Virtual)
///   .sequence(vec![1.0, 2.0, 6.0, 7.0]);
/// let means = source.window(2).unwrap().window_mean();
/// assert_eq!(means.run().unwrap(), [1.5, 4.0, 6.5]);
/// ```
pub trait WindowStats<T>
where
  T: Payload + Into<f64> + Copy,
{
  fn window_mean(&self) -> Event<f64>;

  /// Sample standard deviation, `NaN` for windows of fewer than two values.
  fn window_std(&self) -> Event<f64>;

  fn window_min(&self) -> Event<f64>;

  fn window_max(&self) -> Event<f64>;

  fn window_sum(&self) -> Event<f64>;
}

impl<T> WindowStats<T> for Event<Vec<T>>
where
  T: Payload + Into<f64> + Copy,
{
  fn window_mean(&self) -> Event<f64> {
    statistic(self, stats::mean)
  }

  fn window_std(&self) -> Event<f64> {
    statistic(self, stats::stdev)
  }

  fn window_min(&self) -> Event<f64> {
    statistic(self, stats::min)
  }

  fn window_max(&self) -> Event<f64> {
    statistic(self, stats::max)
  }

  fn window_sum(&self) -> Event<f64> {
    statistic(self, stats::sum)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::scheduler::VirtualScheduler;
  use crate::utils::testing::Recorder;
  use crate::{EventBuilder, Signal};

  fn manual<T: Payload>() -> Event<T> {
    EventBuilder::new()
      .name("manual")
      .scheduler(VirtualScheduler::new())
      .build()
  }

  #[test]
  fn window_test() {
    let source = manual::<i32>();
    let recorder = Recorder::attach(&source.window(3).unwrap());
    (1..=5).for_each(|x| source.emit(x));
    source.set_done();
    assert_eq!(
      recorder.signals(),
      [
        Signal::Value(vec![1, 2, 3]),
        Signal::Value(vec![2, 3, 4]),
        Signal::Value(vec![3, 4, 5]),
        Signal::Done,
      ]
    );
    assert!(source.window(0).is_err());
  }

  #[test]
  fn window_stats_test() {
    let source = manual::<i32>();
    let windows = source.window(3).unwrap();
    let mean = Recorder::attach(&windows.window_mean());
    let std = Recorder::attach(&windows.window_std());
    let min = Recorder::attach(&windows.window_min());
    let max = Recorder::attach(&windows.window_max());
    let sum = Recorder::attach(&windows.window_sum());
    for x in [2, 4, 9, 1].iter() {
      source.emit(*x);
    }
    let close = |a: f64, b: f64| (a - b).abs() < 1e-9;
    let mean = mean.values();
    assert!(close(mean[0], 5.0) && close(mean[1], 14.0 / 3.0));
    assert_eq!(min.values(), [2.0, 1.0]);
    assert_eq!(max.values(), [9.0, 9.0]);
    assert_eq!(sum.values(), [15.0, 14.0]);
    let std = std.values();
    assert!(close(std[0], 13f64.sqrt()));
    assert!(close(std[1], (49.0f64 / 3.0).sqrt()));
  }

  #[test]
  fn single_value_window_std_test() {
    let source = manual::<f32>();
    let std = Recorder::attach(&source.window(1).unwrap().window_std());
    source.emit(1.5);
    assert!(std.values()[0].is_nan());
  }
}
