//! Selection keys: the handle tying a socket to its interest set and
//! attachment on a specific selector.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::conn::Connection;
use crate::sync::{Mutex, ReentrantMutex};

use super::Selector;

/// Value attached to a selection key by the owning server or client manager.
pub(crate) enum Attachment {
  Conn(Connection),
}

/// Handle tying a registered file descriptor to its current interest set and
/// attachment.
///
/// The embedded lock serializes everything that may race with a selection
/// iteration for this key: key handlers run under it, the provider holds it
/// while closing the socket, and the connection-aware selector holds it while
/// dispatching a local close. It is reentrant because a key handler may
/// trigger the provider close for its own key.
pub(crate) struct SelectionKey {
  token: u64,
  fd: RawFd,
  selector: Weak<Selector>,
  interest: Mutex<u8>,
  valid: AtomicBool,
  lock: ReentrantMutex<()>,
  attachment: Mutex<Option<Attachment>>,
}

impl SelectionKey {
  pub(super) fn new(
    token: u64,
    fd: RawFd,
    selector: Weak<Selector>,
    ops: u8,
  ) -> Self {
    Self {
      token,
      fd,
      selector,
      interest: Mutex::new(ops),
      valid: AtomicBool::new(true),
      lock: ReentrantMutex::new(()),
      attachment: Mutex::new(None),
    }
  }

  pub fn token(&self) -> u64 {
    self.token
  }

  pub fn fd(&self) -> RawFd {
    self.fd
  }

  pub fn is_valid(&self) -> bool {
    self.valid.load(Ordering::Acquire)
  }

  pub fn lock(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
    self.lock.lock()
  }

  pub fn selector(&self) -> Option<Arc<Selector>> {
    self.selector.upgrade()
  }

  pub fn wake_selector(&self) {
    if let Some(selector) = self.selector.upgrade() {
      selector.wakeup();
    }
  }

  /// Attach a value. Panics if an attachment was already set.
  pub fn attach(&self, attachment: Attachment) {
    let mut slot = self.attachment.lock();
    assert!(slot.is_none(), "selection key attachment is already set");
    *slot = Some(attachment);
  }

  pub fn attached_connection(&self) -> Option<Connection> {
    match &*self.attachment.lock() {
      Some(Attachment::Conn(conn)) => Some(conn.clone()),
      None => None,
    }
  }

  pub fn interest(&self) -> u8 {
    *self.interest.lock()
  }

  /// Replace the whole interest set.
  pub fn set_interest(&self, ops: u8) {
    let mut interest = self.interest.lock();
    *interest = ops;
    self.apply(*interest);
  }

  /// Add a single op to the interest set; wakes the selector when the set
  /// changed so a blocking select observes the new interest.
  pub fn enable_op(&self, op: u8) {
    let changed = {
      let mut interest = self.interest.lock();
      if *interest & op != 0 {
        false
      } else {
        *interest |= op;
        self.apply(*interest);
        true
      }
    };
    if changed {
      self.wake_selector();
    }
  }

  /// Remove a single op from the interest set.
  pub fn disable_op(&self, op: u8) {
    let mut interest = self.interest.lock();
    if *interest & op == 0 {
      return;
    }
    *interest &= !op;
    self.apply(*interest);
  }

  fn apply(&self, ops: u8) {
    if !self.is_valid() {
      return;
    }
    if let Some(selector) = self.selector.upgrade() {
      if let Err(err) = selector.poller_modify(self.fd, self.token, ops) {
        tracing::debug!(fd = self.fd, "interest update failed: {err}");
      }
    }
  }

  /// Invalidate the key and remove it from the selector. Idempotent. Also
  /// drops the attachment so a connection does not keep itself alive through
  /// its own key.
  pub fn cancel(&self) {
    if self.valid.swap(false, Ordering::AcqRel) {
      if let Some(selector) = self.selector.upgrade() {
        selector.deregister(self.token, self.fd);
      }
    }
    self.attachment.lock().take();
  }
}
