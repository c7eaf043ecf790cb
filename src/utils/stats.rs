//! Pure numeric helpers over a buffer of samples. Empty input gives NaN.

pub fn sum(samples: &[f64]) -> f64 {
  samples.iter().sum()
}

pub fn mean(samples: &[f64]) -> f64 {
  let mut running = Welford::default();
  samples.iter().for_each(|x| running.push(*x));
  running.mean()
}

/// Sample standard deviation (one degree of freedom), NaN below two samples.
pub fn stdev(samples: &[f64]) -> f64 {
  let mut running = Welford::default();
  samples.iter().for_each(|x| running.push(*x));
  running.variance().sqrt()
}

pub fn min(samples: &[f64]) -> f64 {
  if samples.is_empty() {
    return f64::NAN;
  }
  samples.iter().copied().fold(f64::INFINITY, f64::min)
}

pub fn max(samples: &[f64]) -> f64 {
  if samples.is_empty() {
    return f64::NAN;
  }
  samples.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Incremental mean and variance in a single pass without re-summing the
/// history.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Welford {
  count: u64,
  mean: f64,
  m2: f64,
}

impl Welford {
  pub fn push(&mut self, x: f64) {
    self.count += 1;
    let delta = x - self.mean;
    self.mean += delta / self.count as f64;
    self.m2 += delta * (x - self.mean);
  }

  pub fn count(&self) -> u64 {
    self.count
  }

  pub fn mean(&self) -> f64 {
    if self.count == 0 {
      f64::NAN
    } else {
      self.mean
    }
  }

  pub fn variance(&self) -> f64 {
    if self.count < 2 {
      f64::NAN
    } else {
      self.m2 / (self.count - 1) as f64
    }
  }
}
