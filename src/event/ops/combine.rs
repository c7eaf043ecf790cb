//! Operators with several upstream events.
//!
//! Every combinator fails fast: the first error of any source is forwarded
//! and ends the combined event, which releases all of its sources.
use super::{follow_with, guard};
use crate::error::{EventError, Result};
use crate::event::dispatcher::Connection;
use crate::event::observable::{Event, Payload};
use crate::event::subscription::Subscription;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn fail<B: Payload>(node: &Event<B>, error: EventError) {
  node.emit_error(error);
  node.set_done();
}

fn first<T: Payload>(sources: &[Event<T>], operator: &str) -> Result<Event<T>> {
  match sources.first() {
    Some(first) => Ok(first.clone()),
    None => Err(EventError::construction(format!(
      "{} needs at least one source",
      operator
    ))),
  }
}

struct Lanes<T> {
  queues: Vec<VecDeque<T>>,
  done: Vec<bool>,
}

impl<T> Lanes<T> {
  fn new(count: usize) -> Self {
    Lanes {
      queues: (0..count).map(|_| VecDeque::new()).collect(),
      done: vec![false; count],
    }
  }

  /// Every complete row, one value per lane.
  fn rows(&mut self) -> Vec<Vec<T>> {
    let mut rows = Vec::new();
    while self.queues.iter().all(|queue| !queue.is_empty()) {
      let row: Option<Vec<T>> = self.queues.iter_mut().map(VecDeque::pop_front).collect();
      match row {
        Some(row) => rows.push(row),
        None => break,
      }
    }
    rows
  }

  /// No further row can be completed: a finished lane has run dry.
  fn stalled(&self) -> bool {
    self
      .queues
      .iter()
      .zip(self.done.iter())
      .any(|(queue, done)| *done && queue.is_empty())
  }

  fn push(&mut self, index: usize, value: T) {
    if !self.stalled() {
      self.queues[index].push_back(value);
    }
  }

  fn finished(&self) -> bool {
    self.done.iter().all(|done| *done)
  }
}

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Pairs<A, B> {
  left: VecDeque<A>,
  right: VecDeque<B>,
  left_done: bool,
  right_done: bool,
}

impl<A, B> Pairs<A, B> {
  fn drain(&mut self) -> Vec<(A, B)> {
    let count = self.left.len().min(self.right.len());
    self.left.drain(..count).zip(self.right.drain(..count)).collect()
  }

  fn stalled(&self) -> bool {
    (self.left_done && self.left.is_empty()) || (self.right_done && self.right.is_empty())
  }

  fn finished(&self) -> bool {
    self.left_done && self.right_done
  }
}

fn emit_all<B: Payload>(node: &Event<B>, values: Vec<B>, finished: bool) {
  for value in values {
    node.emit(value);
  }
  if finished {
    node.set_done();
  }
}

/// Pairs values by arrival index: the n-th value of `left` with the n-th
/// value of `right`. Unpaired values wait in a queue and are never emitted as
/// a partial pair. Once a finished source has nothing left to pair, further
/// values are discarded. Ends when both sources are done.
pub fn zip<A, B>(left: &Event<A>, right: &Event<B>) -> Event<(A, B)>
where
  A: Payload,
  B: Payload,
{
  let node = left.derive("zip");
  let pairs = Arc::new(Mutex::new(Pairs {
    left: VecDeque::new(),
    right: VecDeque::new(),
    left_done: false,
    right_done: false,
  }));
  let (values, dones) = (pairs.clone(), pairs.clone());
  follow_with(
    left,
    &node,
    move |node, value| {
      let ready = {
        let mut pairs = lock(&values);
        if !pairs.stalled() {
          pairs.left.push_back(value);
        }
        pairs.drain()
      };
      emit_all(node, ready, false);
    },
    fail,
    move |node| {
      let finished = {
        let mut pairs = lock(&dones);
        pairs.left_done = true;
        pairs.finished()
      };
      emit_all(node, Vec::new(), finished);
    },
  );
  let (values, dones) = (pairs.clone(), pairs);
  follow_with(
    right,
    &node,
    move |node, value| {
      let ready = {
        let mut pairs = lock(&values);
        if !pairs.stalled() {
          pairs.right.push_back(value);
        }
        pairs.drain()
      };
      emit_all(node, ready, false);
    },
    fail,
    move |node| {
      let finished = {
        let mut pairs = lock(&dones);
        pairs.right_done = true;
        pairs.finished()
      };
      emit_all(node, Vec::new(), finished);
    },
  );
  node
}

fn zip_rows<T: Payload>(head: &Event<T>, sources: &[Event<T>]) -> Event<Vec<T>> {
  let node = head.derive("zip_all");
  let lanes = Arc::new(Mutex::new(Lanes::new(sources.len())));
  for (index, source) in sources.iter().enumerate() {
    let (values, dones) = (lanes.clone(), lanes.clone());
    follow_with(
      source,
      &node,
      move |node, value| {
        let rows = {
          let mut lanes = lock(&values);
          lanes.push(index, value);
          lanes.rows()
        };
        emit_all(node, rows, false);
      },
      fail,
      move |node| {
        let finished = {
          let mut lanes = lock(&dones);
          lanes.done[index] = true;
          lanes.finished()
        };
        emit_all(node, Vec::new(), finished);
      },
    );
  }
  node
}

/// [zip] over any number of sources of the same type.
pub fn zip_all<T>(sources: &[Event<T>]) -> Result<Event<Vec<T>>>
where
  T: Payload,
{
  let head = first(sources, "zip_all")?;
  Ok(zip_rows(&head, sources))
}

fn merge_all<T: Payload>(head: &Event<T>, sources: &[Event<T>]) -> Event<T> {
  let node = head.derive("merge");
  let remaining = Arc::new(Mutex::new(sources.len()));
  for source in sources {
    let remaining = remaining.clone();
    follow_with(
      source,
      &node,
      |node, value| node.emit(value),
      fail,
      move |node| {
        let last = {
          let mut remaining = lock(&remaining);
          *remaining -= 1;
          *remaining == 0
        };
        emit_all(node, Vec::new(), last);
      },
    );
  }
  node
}

/// Forwards the values of every source in arrival order, ends once all
/// sources are done.
pub fn merge<T>(sources: &[Event<T>]) -> Result<Event<T>>
where
  T: Payload,
{
  let head = first(sources, "merge")?;
  Ok(merge_all(&head, sources))
}

struct Chained<T> {
  current: usize,
  pending: Vec<VecDeque<T>>,
  done: Vec<bool>,
}

impl<T> Chained<T> {
  /// Moves past every finished source, returning the values held back for
  /// the sources which become current, and whether all are finished.
  fn advance(&mut self) -> (Vec<T>, bool) {
    let mut released = Vec::new();
    while self.current < self.done.len() && self.done[self.current] {
      self.current += 1;
      if let Some(queue) = self.pending.get_mut(self.current) {
        released.extend(queue.drain(..));
      }
    }
    (released, self.current >= self.done.len())
  }
}

fn chain_all<T: Payload>(head: &Event<T>, sources: &[Event<T>]) -> Event<T> {
  let node = head.derive("chain");
  let state = Arc::new(Mutex::new(Chained {
    current: 0,
    pending: sources.iter().map(|_| VecDeque::new()).collect(),
    done: vec![false; sources.len()],
  }));
  for (index, source) in sources.iter().enumerate() {
    let (values, dones) = (state.clone(), state.clone());
    follow_with(
      source,
      &node,
      move |node, value| {
        let current = {
          let mut state = lock(&values);
          if state.current == index {
            Some(value)
          } else {
            state.pending[index].push_back(value);
            None
          }
        };
        if let Some(value) = current {
          node.emit(value);
        }
      },
      fail,
      move |node| {
        let (released, finished) = {
          let mut state = lock(&dones);
          state.done[index] = true;
          state.advance()
        };
        emit_all(node, released, finished);
      },
    );
  }
  node
}

/// Emits every value of the first source, then of the second, and so on.
///
/// All sources are subscribed right away, values of a source which is not
/// current yet are held back until every earlier source is done.
pub fn chain<T>(sources: &[Event<T>]) -> Result<Event<T>>
where
  T: Payload,
{
  let head = first(sources, "chain")?;
  Ok(chain_all(&head, sources))
}

struct Latest<T> {
  values: Vec<Option<T>>,
  running: usize,
}

fn latest_rows<T: Payload>(head: &Event<T>, sources: &[Event<T>]) -> Event<Vec<T>> {
  let node = head.derive("zip_latest");
  let latest = Arc::new(Mutex::new(Latest {
    values: vec![None; sources.len()],
    running: sources.len(),
  }));
  for (index, source) in sources.iter().enumerate() {
    let (values, dones) = (latest.clone(), latest.clone());
    follow_with(
      source,
      &node,
      move |node, value| {
        let row = {
          let mut latest = lock(&values);
          latest.values[index] = Some(value);
          latest.values.iter().cloned().collect::<Option<Vec<T>>>()
        };
        if let Some(row) = row {
          node.emit(row);
        }
      },
      fail,
      move |node| {
        let last = {
          let mut latest = lock(&dones);
          latest.running -= 1;
          latest.running == 0
        };
        emit_all(node, Vec::new(), last);
      },
    );
  }
  node
}

/// Emits the latest value of every source each time any source emits, once
/// all of them have emitted at least once. Ends once all sources are done.
pub fn zip_latest<T>(sources: &[Event<T>]) -> Result<Event<Vec<T>>>
where
  T: Payload,
{
  let head = first(sources, "zip_latest")?;
  Ok(latest_rows(&head, sources))
}

/// How a [Join] treats values of the sources added to it.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Policy {
  /// Every value of every source.
  Merge,
  /// The values of the source added first, later sources are held back
  /// until every earlier source is done.
  Chain,
  /// A value of a source drops every source added before it.
  Concat,
  /// A value of a source drops the source which emitted last, if it is
  /// another one.
  Switch,
}

struct Joined<T> {
  key: usize,
  event: usize,
  subscription: Option<Subscription>,
  done: bool,
  held: VecDeque<T>,
}

struct JoinState<T> {
  policy: Policy,
  sources: VecDeque<Joined<T>>,
  next_key: usize,
  active: Option<usize>,
  parent_done: bool,
  closed: bool,
}

impl<T> JoinState<T> {
  fn position(&self, key: usize) -> Option<usize> {
    self.sources.iter().position(|source| source.key == key)
  }

  fn finished(&self) -> bool {
    self.parent_done && self.sources.is_empty()
  }
}

/// Joins a dynamic set of sources into `node`. Sources can be added until
/// [close](Join::close) is called, `node` ends once it is closed and every
/// source is done. Errors of a source end `node`.
struct Join<T>
where
  T: Payload,
{
  node: Event<T>,
  state: Arc<Mutex<JoinState<T>>>,
}

impl<T> Clone for Join<T>
where
  T: Payload,
{
  fn clone(&self) -> Self {
    Join {
      node: self.node.clone(),
      state: self.state.clone(),
    }
  }
}

fn disconnect_all(subscriptions: Vec<Subscription>) {
  for subscription in subscriptions {
    subscription.disconnect();
  }
}

impl<T> Join<T>
where
  T: Payload,
{
  fn new(node: &Event<T>, policy: Policy) -> Self {
    let state = Arc::new(Mutex::new(JoinState {
      policy,
      sources: VecDeque::new(),
      next_key: 0,
      active: None,
      parent_done: false,
      closed: false,
    }));
    let teardown = state.clone();
    node.on_teardown(move || {
      let mut state = lock(&teardown);
      state.closed = true;
      let subscriptions: Vec<Subscription> = state
        .sources
        .drain(..)
        .filter_map(|source| source.subscription)
        .collect();
      drop(state);
      disconnect_all(subscriptions);
    });
    Join {
      node: node.clone(),
      state,
    }
  }

  fn add(&self, source: &Event<T>) {
    let key = {
      let mut state = lock(&self.state);
      let duplicate = state.policy == Policy::Concat
        && state.sources.iter().any(|joined| joined.event == source.id());
      if state.closed || duplicate {
        return;
      }
      let key = state.next_key;
      state.next_key += 1;
      state.sources.push_back(Joined {
        key,
        event: source.id(),
        subscription: None,
        done: false,
        held: VecDeque::new(),
      });
      key
    };
    let (values, dones) = (self.clone(), self.clone());
    let errors = self.node.clone();
    let connection = Connection::func(move |value: T| {
      guard(&values.node, || values.on_value(key, value))
    })
    .on_error(move |error: &EventError| guard(&errors, || fail(&errors, error.clone())))
    .on_done(move || guard(&dones.node, || dones.on_done(key)));
    let subscription = source.attach(connection, false);
    let mut state = lock(&self.state);
    match state.position(key) {
      Some(position) => state.sources[position].subscription = Some(subscription),
      None => {
        drop(state);
        subscription.disconnect();
      }
    }
  }

  fn on_value(&self, key: usize, value: T) {
    let (value, dropped) = {
      let mut state = lock(&self.state);
      let position = match state.position(key) {
        Some(position) => position,
        None => return,
      };
      let mut dropped = Vec::new();
      let value = match state.policy {
        Policy::Merge => Some(value),
        Policy::Chain if position > 0 => {
          state.sources[position].held.push_back(value);
          None
        }
        Policy::Chain => Some(value),
        Policy::Concat => {
          dropped.extend(
            state
              .sources
              .drain(..position)
              .filter_map(|source| source.subscription),
          );
          Some(value)
        }
        Policy::Switch => {
          if state.active != Some(key) {
            let previous = state.active.and_then(|active| state.position(active));
            if let Some(previous) = previous {
              dropped.extend(
                state
                  .sources
                  .remove(previous)
                  .and_then(|source| source.subscription),
              );
            }
            state.active = Some(key);
          }
          Some(value)
        }
      };
      (value, dropped)
    };
    disconnect_all(dropped);
    if let Some(value) = value {
      self.node.emit(value);
    }
  }

  fn on_done(&self, key: usize) {
    let (released, finished) = {
      let mut state = lock(&self.state);
      let position = match state.position(key) {
        Some(position) => position,
        None => return,
      };
      let mut released = Vec::new();
      if state.policy == Policy::Chain {
        state.sources[position].done = true;
        while state.sources.front().map_or(false, |source| source.done) {
          state.sources.pop_front();
          if let Some(front) = state.sources.front_mut() {
            released.extend(front.held.drain(..));
          }
        }
      } else {
        state.sources.remove(position);
        if state.active == Some(key) {
          state.active = None;
        }
      }
      (released, state.finished())
    };
    emit_all(&self.node, released, finished);
  }

  /// No more sources will be added.
  fn close(&self) {
    let finished = {
      let mut state = lock(&self.state);
      state.parent_done = true;
      state.finished()
    };
    if finished {
      self.node.set_done();
    }
  }
}

fn join<T>(head: &Event<T>, operator: &str, policy: Policy, sources: &[Event<T>]) -> Event<T>
where
  T: Payload,
{
  let node = head.derive(operator);
  let join = Join::new(&node, policy);
  for source in sources {
    join.add(source);
  }
  join.close();
  node
}

/// Forwards the values of the source which emitted last. A value of another
/// source drops the previous one for good. Ends once all remaining sources
/// are done.
pub fn switch<T>(sources: &[Event<T>]) -> Result<Event<T>>
where
  T: Payload,
{
  let head = first(sources, "switch")?;
  Ok(join(&head, "switch", Policy::Switch, sources))
}

/// Forwards values in source order: once a source emits, every source listed
/// before it is dropped. Ends once all remaining sources are done.
pub fn concat<T>(sources: &[Event<T>]) -> Result<Event<T>>
where
  T: Payload,
{
  let head = first(sources, "concat")?;
  Ok(join(&head, "concat", Policy::Concat, sources))
}

fn join_map<T, B, F>(source: &Event<T>, operator: &str, policy: Policy, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  F: Fn(T) -> Event<B> + Send + Sync + 'static,
{
  let node = source.derive(operator);
  let join = Join::new(&node, policy);
  let (values, dones) = (join.clone(), join);
  follow_with(
    source,
    &node,
    move |_, value| values.add(&func(value)),
    |node, error| node.emit_error(error),
    move |_| dones.close(),
  );
  node
}

/// Maps every value to an event and forwards the values of all of them.
/// Ends once `source` and every mapped event are done.
pub fn merge_map<T, B, F>(source: &Event<T>, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  F: Fn(T) -> Event<B> + Send + Sync + 'static,
{
  join_map(source, "merge_map", Policy::Merge, func)
}

/// Maps every value to an event and forwards their values one event after
/// the other, holding back the values of later events.
pub fn chain_map<T, B, F>(source: &Event<T>, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  F: Fn(T) -> Event<B> + Send + Sync + 'static,
{
  join_map(source, "chain_map", Policy::Chain, func)
}

/// Maps every value to an event, see [concat].
pub fn concat_map<T, B, F>(source: &Event<T>, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  F: Fn(T) -> Event<B> + Send + Sync + 'static,
{
  join_map(source, "concat_map", Policy::Concat, func)
}

/// Maps every value to an event, see [switch].
pub fn switch_map<T, B, F>(source: &Event<T>, func: F) -> Event<B>
where
  T: Payload,
  B: Payload,
  F: Fn(T) -> Event<B> + Send + Sync + 'static,
{
  join_map(source, "switch_map", Policy::Switch, func)
}

/// Fans one source out into branches and joins the branches back into a
/// single event.
///
/// # Example
/// ```
/// use eventflow::EventBuilder;
/// use eventflow::event::ops::{Combine, Transform};
/// use eventflow::event::scheduler::SchedulerType;
///
/// let source = EventBuilder::new()
///   .scheduler_type(SchedulerType::Virtual)
///   .sequence(vec![1, 2, 3]);
/// let joined = source
///   .fork()
///   .branch(|e| e.map(|x| x + 1))
///   .branch(|e| e.map(|x| x * 10))
///   .zip()
///   .unwrap();
/// assert_eq!(joined.run().unwrap(), [vec![2, 10], vec![3, 20], vec![4, 30]]);
/// ```
pub struct Fork<T, B>
where
  T: Payload,
  B: Payload,
{
  source: Event<T>,
  branches: Vec<Event<B>>,
}

impl<T, B> Fork<T, B>
where
  T: Payload,
  B: Payload,
{
  pub fn new(source: &Event<T>) -> Self {
    Fork {
      source: source.clone(),
      branches: Vec::new(),
    }
  }

  /// Adds the event built by `operator` from the source as a branch.
  pub fn branch<F>(mut self, operator: F) -> Self
  where
    F: FnOnce(&Event<T>) -> Event<B>,
  {
    self.branches.push(operator(&self.source));
    self
  }

  pub fn branches(&self) -> &[Event<B>] {
    &self.branches
  }

  pub fn zip(self) -> Result<Event<Vec<B>>> {
    zip_all(&self.branches)
  }

  pub fn merge(self) -> Result<Event<B>> {
    merge(&self.branches)
  }

  pub fn chain(self) -> Result<Event<B>> {
    chain(&self.branches)
  }

  pub fn zip_latest(self) -> Result<Event<Vec<B>>> {
    zip_latest(&self.branches)
  }

  pub fn switch(self) -> Result<Event<B>> {
    switch(&self.branches)
  }

  pub fn concat(self) -> Result<Event<B>> {
    concat(&self.branches)
  }
}

/// Combinators with `self` as the first source.
pub trait Combine<T>
where
  T: Payload,
{
  fn zip<U>(&self, other: &Event<U>) -> Event<(T, U)>
  where
    U: Payload;

  fn zip_all(&self, others: &[Event<T>]) -> Event<Vec<T>>;

  fn merge(&self, others: &[Event<T>]) -> Event<T>;

  fn chain(&self, others: &[Event<T>]) -> Event<T>;

  fn zip_latest(&self, others: &[Event<T>]) -> Event<Vec<T>>;

  fn switch(&self, others: &[Event<T>]) -> Event<T>;

  fn concat(&self, others: &[Event<T>]) -> Event<T>;

  fn merge_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static;

  fn chain_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static;

  fn concat_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static;

  fn switch_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static;

  fn fork<B>(&self) -> Fork<T, B>
  where
    B: Payload;
}

fn with_first<T: Payload>(first: &Event<T>, others: &[Event<T>]) -> Vec<Event<T>> {
  let mut sources = Vec::with_capacity(others.len() + 1);
  sources.push(first.clone());
  sources.extend(others.iter().cloned());
  sources
}

impl<T> Combine<T> for Event<T>
where
  T: Payload,
{
  fn zip<U>(&self, other: &Event<U>) -> Event<(T, U)>
  where
    U: Payload,
  {
    zip(self, other)
  }

  fn zip_all(&self, others: &[Event<T>]) -> Event<Vec<T>> {
    zip_rows(self, &with_first(self, others))
  }

  fn merge(&self, others: &[Event<T>]) -> Event<T> {
    merge_all(self, &with_first(self, others))
  }

  fn chain(&self, others: &[Event<T>]) -> Event<T> {
    chain_all(self, &with_first(self, others))
  }

  fn zip_latest(&self, others: &[Event<T>]) -> Event<Vec<T>> {
    latest_rows(self, &with_first(self, others))
  }

  fn switch(&self, others: &[Event<T>]) -> Event<T> {
    join(self, "switch", Policy::Switch, &with_first(self, others))
  }

  fn concat(&self, others: &[Event<T>]) -> Event<T> {
    join(self, "concat", Policy::Concat, &with_first(self, others))
  }

  fn merge_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static,
  {
    merge_map(self, func)
  }

  fn chain_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static,
  {
    chain_map(self, func)
  }

  fn concat_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static,
  {
    concat_map(self, func)
  }

  fn switch_map<B, F>(&self, func: F) -> Event<B>
  where
    B: Payload,
    F: Fn(T) -> Event<B> + Send + Sync + 'static,
  {
    switch_map(self, func)
  }

  fn fork<B>(&self) -> Fork<T, B>
  where
    B: Payload,
  {
    Fork::new(self)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::ops::Transform;
  use crate::event::scheduler::VirtualScheduler;
  use crate::utils::testing::Recorder;
  use crate::{EventBuilder, Signal};

  fn manual<T: Payload>(name: &str, scheduler: &Arc<VirtualScheduler>) -> Event<T> {
    EventBuilder::new()
      .name(name)
      .scheduler(scheduler.clone())
      .build()
  }

  #[test]
  fn zip_drops_unpaired_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    let b = manual::<char>("b", &scheduler);
    let zipped = Recorder::attach(&a.zip(&b));
    (1..=3).for_each(|x| a.emit(x));
    a.set_done();
    assert!(!zipped.is_done());
    b.emit('x');
    b.emit('y');
    b.set_done();
    assert_eq!(
      zipped.signals(),
      [Signal::Value((1, 'x')), Signal::Value((2, 'y')), Signal::Done]
    );
  }

  #[test]
  fn zip_waits_for_last_source_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    let b = manual::<i32>("b", &scheduler);
    let zipped = Recorder::attach(&a.zip(&b));
    a.emit(1);
    b.emit(10);
    b.set_done();
    assert!(!zipped.is_done());
    assert_eq!(a.len(), 1);
    a.emit(2);
    a.emit(3);
    assert_eq!(zipped.signals(), [Signal::Value((1, 10))]);
    a.set_done();
    assert_eq!(zipped.signals(), [Signal::Value((1, 10)), Signal::Done]);
    assert!(a.is_empty());
  }

  #[test]
  fn zip_all_waits_for_every_source_test() {
    let scheduler = VirtualScheduler::new();
    let sources: Vec<_> = (0..3)
      .map(|i| manual::<i32>(&format!("s{}", i), &scheduler))
      .collect();
    let zipped = Recorder::attach(&zip_all(&sources).unwrap());
    sources[0].set_done();
    sources[1].emit(1);
    sources[1].set_done();
    assert!(!zipped.is_done());
    sources[2].emit(2);
    sources[2].set_done();
    assert_eq!(zipped.signals(), [Signal::Done]);
  }

  #[test]
  fn zip_all_test() {
    let scheduler = VirtualScheduler::new();
    let sources: Vec<_> = (0..3)
      .map(|i| manual::<i32>(&format!("s{}", i), &scheduler))
      .collect();
    let zipped = Recorder::attach(&zip_all(&sources).unwrap());
    sources[0].emit(1);
    sources[1].emit(2);
    sources[0].emit(4);
    sources[2].emit(3);
    assert_eq!(zipped.values(), [vec![1, 2, 3]]);
    assert!(zip_all::<i32>(&[]).is_err());
  }

  #[test]
  fn merge_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    let b = manual::<i32>("b", &scheduler);
    let merged = Recorder::attach(&a.merge(&[b.clone()]));
    a.emit(1);
    b.emit(2);
    a.emit(3);
    a.set_done();
    assert!(!merged.is_done());
    b.emit(4);
    b.set_done();
    assert_eq!(
      merged.signals(),
      [
        Signal::Value(1),
        Signal::Value(2),
        Signal::Value(3),
        Signal::Value(4),
        Signal::Done,
      ]
    );
  }

  #[test]
  fn merge_fails_fast_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    let b = manual::<i32>("b", &scheduler);
    let merged = Recorder::attach(&a.merge(&[b.clone()]));
    a.emit(1);
    b.emit_error(EventError::custom("broken"));
    a.emit(2);
    assert_eq!(
      merged.signals(),
      [
        Signal::Value(1),
        Signal::Error(EventError::custom("broken")),
        Signal::Done,
      ]
    );
    assert!(a.is_empty());
    assert!(b.is_empty());
  }

  #[test]
  fn chain_holds_back_later_sources_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    let b = manual::<i32>("b", &scheduler);
    let c = manual::<i32>("c", &scheduler);
    let chained = Recorder::attach(&a.chain(&[b.clone(), c.clone()]));
    b.emit(10);
    a.emit(1);
    c.emit(100);
    c.set_done();
    a.emit(2);
    b.emit(20);
    assert_eq!(chained.values(), [1, 2]);
    a.set_done();
    assert_eq!(chained.values(), [1, 2, 10, 20]);
    assert!(!chained.is_done());
    b.set_done();
    assert_eq!(chained.values(), [1, 2, 10, 20, 100]);
    assert!(chained.is_done());
  }

  #[test]
  fn zip_latest_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    let b = manual::<i32>("b", &scheduler);
    let latest = Recorder::attach(&a.zip_latest(&[b.clone()]));
    a.emit(1);
    a.emit(2);
    b.emit(10);
    a.emit(3);
    b.emit(20);
    a.set_done();
    b.set_done();
    assert_eq!(
      latest.signals(),
      [
        Signal::Value(vec![2, 10]),
        Signal::Value(vec![3, 10]),
        Signal::Value(vec![3, 20]),
        Signal::Done,
      ]
    );
  }

  #[test]
  fn fork_join_test() {
    let scheduler = VirtualScheduler::new();
    let source = EventBuilder::new()
      .scheduler(scheduler.clone())
      .sequence(vec![1, 2]);
    let fork = source
      .fork::<i32>()
      .branch(|e| e.map(|x| x * 2))
      .branch(|e| e.map(|x| -x));
    assert_eq!(fork.branches().len(), 2);
    let merged = Recorder::attach(&fork.merge().unwrap());
    scheduler.run();
    assert_eq!(merged.values(), [2, -1, 4, -2]);
    assert!(merged.is_done());
    assert!(Fork::<i32, i32>::new(&source).chain().is_err());
  }

  #[test]
  fn switch_drops_previous_source_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    let b = manual::<i32>("b", &scheduler);
    let switched = Recorder::attach(&a.switch(&[b.clone()]));
    a.emit(1);
    b.emit(2);
    a.emit(3);
    b.emit(4);
    assert!(!switched.is_done());
    b.set_done();
    assert_eq!(
      switched.signals(),
      [Signal::Value(1), Signal::Value(2), Signal::Value(4), Signal::Done]
    );
  }

  #[test]
  fn switch_of_finished_sources_test() {
    let scheduler = VirtualScheduler::new();
    let a = manual::<i32>("a", &scheduler);
    a.set_done();
    let switched = switch(&[a]).unwrap();
    assert!(switched.is_done());
    assert!(switch::<i32>(&[]).is_err());
  }

  #[test]
  fn concat_drops_earlier_sources_test() {
    let scheduler = VirtualScheduler::new();
    let sources: Vec<_> = (0..3)
      .map(|i| manual::<i32>(&format!("s{}", i), &scheduler))
      .collect();
    let concatenated = Recorder::attach(&concat(&sources).unwrap());
    sources[1].emit(1);
    sources[0].emit(9);
    sources[0].set_done();
    sources[2].emit(2);
    sources[1].emit(8);
    assert!(!concatenated.is_done());
    sources[2].set_done();
    assert_eq!(
      concatenated.signals(),
      [Signal::Value(1), Signal::Value(2), Signal::Done]
    );
  }

  type Spawned = Arc<Mutex<Vec<Event<i32>>>>;

  /// A mapping function creating manual events, handed out for the test to drive.
  fn spawner(
    scheduler: &Arc<VirtualScheduler>,
  ) -> (Spawned, impl Fn(i32) -> Event<i32> + Send + Sync + 'static) {
    let spawned: Spawned = Default::default();
    let (created, scheduler) = (spawned.clone(), scheduler.clone());
    let func = move |x: i32| {
      let event = manual::<i32>(&format!("inner{}", x), &scheduler);
      created.lock().unwrap().push(event.clone());
      event
    };
    (spawned, func)
  }

  fn spawned(events: &Spawned, index: usize) -> Event<i32> {
    events.lock().unwrap()[index].clone()
  }

  #[test]
  fn merge_map_test() {
    let scheduler = VirtualScheduler::new();
    let outer = manual::<i32>("outer", &scheduler);
    let (inners, func) = spawner(&scheduler);
    let merged = Recorder::attach(&outer.merge_map(func));
    outer.emit(1);
    outer.emit(2);
    spawned(&inners, 1).emit(20);
    spawned(&inners, 0).emit(10);
    outer.set_done();
    spawned(&inners, 0).set_done();
    assert!(!merged.is_done());
    spawned(&inners, 1).set_done();
    assert_eq!(
      merged.signals(),
      [Signal::Value(20), Signal::Value(10), Signal::Done]
    );
  }

  #[test]
  fn chain_map_holds_back_later_events_test() {
    let scheduler = VirtualScheduler::new();
    let outer = manual::<i32>("outer", &scheduler);
    let (inners, func) = spawner(&scheduler);
    let chained = Recorder::attach(&outer.chain_map(func));
    outer.emit(1);
    outer.emit(2);
    spawned(&inners, 1).emit(20);
    spawned(&inners, 0).emit(10);
    assert_eq!(chained.values(), [10]);
    spawned(&inners, 0).set_done();
    assert_eq!(chained.values(), [10, 20]);
    outer.set_done();
    spawned(&inners, 1).set_done();
    assert!(chained.is_done());
  }

  #[test]
  fn switch_map_follows_latest_event_test() {
    let scheduler = VirtualScheduler::new();
    let outer = manual::<i32>("outer", &scheduler);
    let (inners, func) = spawner(&scheduler);
    let switched = Recorder::attach(&outer.switch_map(func));
    outer.emit(1);
    outer.emit(2);
    spawned(&inners, 0).emit(10);
    spawned(&inners, 1).emit(20);
    spawned(&inners, 0).emit(11);
    outer.set_done();
    assert!(!switched.is_done());
    spawned(&inners, 1).set_done();
    assert_eq!(
      switched.signals(),
      [Signal::Value(10), Signal::Value(20), Signal::Done]
    );
  }

  #[test]
  fn concat_map_errors_test() {
    let scheduler = VirtualScheduler::new();
    let outer = manual::<i32>("outer", &scheduler);
    let (inners, func) = spawner(&scheduler);
    let concatenated = Recorder::attach(&outer.concat_map(func));
    outer.emit_error(EventError::custom("outer"));
    assert_eq!(concatenated.errors(), [EventError::custom("outer")]);
    assert!(!concatenated.is_done());
    outer.emit(1);
    spawned(&inners, 0).emit(10);
    spawned(&inners, 0).emit_error(EventError::custom("inner"));
    assert!(concatenated.is_done());
    spawned(&inners, 0).emit(11);
    assert_eq!(concatenated.values(), [10]);
    assert_eq!(concatenated.errors().len(), 2);
  }
}
