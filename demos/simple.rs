//! Two manual events merged into one stream, consumed asynchronously.

use eventflow::event::ops::*;
use eventflow::EventBuilder;

use futures::executor::block_on;
use futures::StreamExt;

#[derive(Debug, Clone)]
enum Reading {
  Left(i32),
  Right(i32),
}

impl Reading {
  fn value(&self) -> i32 {
    match self {
      Self::Left(value) | Self::Right(value) => *value,
    }
  }
}

impl std::fmt::Display for Reading {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Left(value) => write!(f, "left reading '{}'", value),
      Self::Right(value) => write!(f, "right reading '{}'", value),
    }
  }
}

fn main() {
  let a = EventBuilder::new().name("a").build::<Reading>();
  let b = EventBuilder::new().name("b").build::<Reading>();
  let merged = a
    .map(|x| Reading::Left(x.value().pow(2)))
    .merge(&[b.map(|x| Reading::Right(x.value() * 3))])
    .tap(|x| println!("{}", x))
    .take(6);
  let consumer = merged.consume().expect("fresh event has no consumer");
  // Manual events dispatch synchronously, the consumer buffers until polled.
  for x in 1..=3 {
    a.emit(Reading::Left(x));
  }
  for x in 1..=3 {
    b.emit(Reading::Right(x));
  }
  let received: Vec<_> = block_on(consumer.collect());
  println!("received {} readings", received.len());
}
