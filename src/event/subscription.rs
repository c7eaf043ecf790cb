use log::debug;

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

/// Type erased side of an event which registrations can be removed from.
pub(crate) trait Detach: Send + Sync {
  fn detach(&self, slot: usize);
  fn name(&self) -> String;
}

/// Handle to a registration on an event.
///
/// The handle only refers back to the event weakly, holding one never keeps
/// an event alive. Dropping the handle leaves the registration in place,
/// [disconnect](Subscription::disconnect) removes it. Disconnecting is
/// idempotent and safe to call from inside a listener of the same event.
pub struct Subscription {
  slot: usize,
  event: Weak<dyn Detach>,
  disconnected: AtomicBool,
}

impl Subscription {
  pub(crate) fn new(slot: usize, event: Weak<dyn Detach>) -> Self {
    Subscription {
      slot,
      event,
      disconnected: AtomicBool::new(false),
    }
  }

  /// A handle of a registration which was never made, e.g. a connection to
  /// an event which is already done.
  pub(crate) fn inactive(event: Weak<dyn Detach>) -> Self {
    Subscription {
      slot: 0,
      event,
      disconnected: AtomicBool::new(true),
    }
  }

  pub fn disconnect(&self) {
    if self.disconnected.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(event) = self.event.upgrade() {
      debug!("disconnecting slot {} from `{}`", self.slot, event.name());
      event.detach(self.slot);
    }
  }

  /// `true` until disconnected or until the event is gone.
  pub fn active(&self) -> bool {
    !self.disconnected.load(Ordering::Acquire) && self.event.strong_count() > 0
  }
}

impl Debug for Subscription {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("slot", &self.slot)
      .field("active", &self.active())
      .finish()
  }
}
