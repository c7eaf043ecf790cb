/// Fixed capacity buffer keeping the most recent `size` items.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
  front: usize,
  filled: bool,
  raw: Vec<T>,
  size: usize,
}

impl<T> RingBuffer<T>
where
  T: Clone,
{
  pub fn new(size: usize) -> RingBuffer<T> {
    RingBuffer {
      front: 0,
      filled: false,
      raw: Vec::with_capacity(size),
      size,
    }
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn len(&self) -> usize {
    self.raw.len()
  }

  pub fn is_empty(&self) -> bool {
    self.raw.is_empty()
  }

  pub fn is_full(&self) -> bool {
    self.filled
  }

  /// Appends `value`, overwriting the oldest item once full.
  pub fn push(&mut self, value: T) {
    if self.size == 0 {
      return;
    }
    if self.raw.len() < self.size {
      self.raw.push(value);
    } else {
      self.raw[self.front] = value;
    }
    self.front = (self.front + 1) % self.size;
    if self.front == 0 {
      self.filled = true;
    }
  }

  /// The `num` most recent items, oldest first.
  pub fn get(&self, num: usize) -> Vec<T> {
    let fetch = num.min(self.raw.len());
    let mut result = Vec::with_capacity(fetch);
    if self.filled {
      let back = (self.front + self.size - fetch) % self.size;
      for i in 0..fetch {
        result.push(self.raw[(back + i) % self.size].clone());
      }
    } else {
      result.extend(self.raw[self.raw.len() - fetch..].iter().cloned());
    }
    result
  }

  /// Every buffered item, oldest first.
  pub fn snapshot(&self) -> Vec<T> {
    self.get(self.size)
  }

  pub fn clear(&mut self) {
    self.raw.clear();
    self.front = 0;
    self.filled = false;
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn new_ring_buffer_test() {
    let ring = RingBuffer::<()>::new(5);
    assert_eq!(ring.size(), 5);
    assert!(!ring.is_full());
    assert_eq!(ring.front, 0);
    assert!(ring.is_empty());
  }

  #[test]
  fn push_test() {
    let mut ring = RingBuffer::new(5);
    ring.push(1);
    ring.push(2);
    ring.push(3);
    assert_eq!(ring.raw, [1, 2, 3]);
    assert_eq!(ring.len(), 3);
  }

  #[test]
  fn overflow_test() {
    let mut ring = RingBuffer::new(3);
    for x in 1..=6 {
      ring.push(x);
    }
    assert_eq!(ring.raw, [4, 5, 6]);
    assert!(ring.is_full());
  }

  #[test]
  fn get_unfilled_test() {
    let mut ring = RingBuffer::new(5);
    ring.push(1);
    ring.push(2);
    ring.push(3);
    assert_eq!(ring.get(2), [2, 3]);
    assert_eq!(ring.snapshot(), [1, 2, 3]);
  }

  #[test]
  fn get_wraparound_test() {
    let mut ring = RingBuffer::new(3);
    for x in 1..=5 {
      ring.push(x);
    }
    assert_eq!(ring.get(2), [4, 5]);
    assert_eq!(ring.snapshot(), [3, 4, 5]);
    assert_eq!(ring.get(0), Vec::<i32>::new());
  }

  #[test]
  fn clear_test() {
    let mut ring = RingBuffer::new(2);
    ring.push(1);
    ring.push(2);
    ring.clear();
    ring.push(3);
    assert_eq!(ring.snapshot(), [3]);
    assert!(!ring.is_full());
  }
}
